//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Text payload extraction: direct decimal, JSON path, XML node/attribute."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{anyhow, bail, Context, Result};

use crate::rows::Extraction;

/// Parse a decimal from device text. Meters in the field emit both `1.5`
/// and `1,5`; a decimal comma is normalised before parsing.
pub fn parse_decimal(text: &str) -> Result<f64> {
    let trimmed = text.trim().replace(',', ".");
    trimmed
        .parse::<f64>()
        .with_context(|| format!("'{}' is not a decimal number", text.trim()))
}

/// Apply one extraction mode to a payload. Any missing node/token or
/// unparseable number is a hard failure for the reading; the only
/// exception is the empty-XML-attribute fallback documented on
/// [`extract_xml`].
pub fn extract(payload: &str, extraction: &Extraction) -> Result<f64> {
    match extraction {
        Extraction::Direct => parse_decimal(payload),
        Extraction::Json { path } => extract_json(payload, path),
        Extraction::Xml {
            path,
            header_name,
            header_value,
            value_attribute,
        } => extract_xml(
            payload,
            path,
            header_name.as_deref(),
            header_value.as_deref(),
            value_attribute.as_deref(),
        ),
    }
}

/// Evaluate a `$.a.b[0].c` path against a JSON document and parse the
/// resulting scalar. Number and numeric-string leaves are accepted.
pub fn extract_json(payload: &str, path: &str) -> Result<f64> {
    let document: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;

    let mut node = &document;
    for segment in parse_json_path(path)? {
        node = match segment {
            JsonSegment::Key(key) => node
                .get(&key)
                .ok_or_else(|| anyhow!("no member '{}' in JSON path {}", key, path))?,
            JsonSegment::Index(index) => node
                .get(index)
                .ok_or_else(|| anyhow!("no index [{}] in JSON path {}", index, path))?,
        };
    }

    match node {
        serde_json::Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| anyhow!("number at {} does not fit an f64", path)),
        serde_json::Value::String(text) => parse_decimal(text),
        other => bail!("JSON path {} selected a non-scalar: {}", path, other),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum JsonSegment {
    Key(String),
    Index(usize),
}

fn parse_json_path(path: &str) -> Result<Vec<JsonSegment>> {
    let body = path.strip_prefix("$.").or_else(|| path.strip_prefix('$'));
    let body = body.unwrap_or(path);
    if body.is_empty() {
        bail!("empty JSON path");
    }

    let mut segments = Vec::new();
    for raw in body.split('.') {
        let mut rest = raw;
        let key_end = rest.find('[').unwrap_or(rest.len());
        let key = &rest[..key_end];
        if !key.is_empty() {
            segments.push(JsonSegment::Key(key.to_owned()));
        }
        rest = &rest[key_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| anyhow!("unclosed index bracket in JSON path {}", path))?;
            let index = stripped[..close]
                .parse::<usize>()
                .with_context(|| format!("bad array index in JSON path {}", path))?;
            segments.push(JsonSegment::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            bail!("malformed segment '{}' in JSON path {}", raw, path);
        }
    }
    Ok(segments)
}

/// Evaluate a slash-separated tag path against an XML document.
///
/// Exactly one matching node: take its text content, parse it, hard-fail
/// if it is not a number. Multiple matches: select the node whose
/// `header_name` attribute equals `header_value` and read `value_attribute`
/// from it; an attribute that is present but empty yields `0`, preserved
/// behaviour for devices that blank the field while idle.
pub fn extract_xml(
    payload: &str,
    path: &str,
    header_name: Option<&str>,
    header_value: Option<&str>,
    value_attribute: Option<&str>,
) -> Result<f64> {
    let document = roxmltree::Document::parse(payload).context("payload is not valid XML")?;

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        bail!("empty XML path");
    }

    let mut matches: Vec<roxmltree::Node<'_, '_>> = vec![document.root()];
    for segment in &segments {
        matches = matches
            .into_iter()
            .flat_map(|node| {
                node.children()
                    .filter(|child| child.is_element() && child.tag_name().name() == *segment)
                    .collect::<Vec<_>>()
            })
            .collect();
    }

    match matches.len() {
        0 => bail!("no node matches XML path {}", path),
        1 => {
            let text = matches[0].text().unwrap_or("");
            parse_decimal(text)
        }
        _ => {
            let header_name =
                header_name.ok_or_else(|| anyhow!("{} matches several nodes but no header_name is configured", path))?;
            let header_value = header_value
                .ok_or_else(|| anyhow!("{} matches several nodes but no header_value is configured", path))?;
            let value_attribute = value_attribute
                .ok_or_else(|| anyhow!("{} matches several nodes but no value_attribute is configured", path))?;

            let node = matches
                .iter()
                .find(|node| node.attribute(header_name) == Some(header_value))
                .ok_or_else(|| {
                    anyhow!(
                        "no node at {} with {}=\"{}\"",
                        path,
                        header_name,
                        header_value
                    )
                })?;
            let raw = node.attribute(value_attribute).ok_or_else(|| {
                anyhow!("selected node at {} has no attribute {}", path, value_attribute)
            })?;
            if raw.trim().is_empty() {
                return Ok(0.0);
            }
            parse_decimal(raw)
        }
    }
}
