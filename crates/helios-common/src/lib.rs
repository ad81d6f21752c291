//! ---
//! ems_section: "00-common"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging for the Helios engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Ambient concerns shared by every Helios binary: the TOML configuration
//! model (including the untyped per-source parameter blobs) and tracing
//! initialisation.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, EngineConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, RawSourceConfig,
};
pub use logging::{init_tracing, LogFormat};
