//! ---
//! ems_section: "01-value-engine"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Result value calibration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// User-configurable sign applied after the correction factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    Plus,
    Minus,
}

/// Linear calibration applied to every decoded raw reading before it is
/// merged: `value * factor`, negated for `Minus`.
pub fn apply_correction(raw: f64, factor: f64, operator: Operator) -> f64 {
    match operator {
        Operator::Plus => raw * factor,
        Operator::Minus => -(raw * factor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minus_negates_the_scaled_value() {
        assert_eq!(apply_correction(14.0, 10.0, Operator::Minus), -140.0);
    }

    #[test]
    fn plus_with_unit_factor_is_identity() {
        assert_eq!(apply_correction(18.7, 1.0, Operator::Plus), 18.7);
    }

    #[test]
    fn fractional_factor_scales_down() {
        assert_eq!(apply_correction(2300.0, 0.001, Operator::Plus), 2.3);
    }
}
