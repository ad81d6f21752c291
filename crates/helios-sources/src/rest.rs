//! ---
//! ems_section: "03-protocol-adapters"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "REST/HTTP polling adapter with JSON/XML extraction."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use helios_core::{SourceAdapter, SourceFilter, SourceUnit};
use helios_values::{apply_correction, FetchFn, PolledSource, SourceKey, SourceKind, ValueKey};

use crate::extract;
use crate::rows::RestSourceConfig;
use crate::store::SourceConfigStore;

/// One poll: short-lived client per call, one GET, every result row
/// extracted from the same body.
async fn fetch(config: Arc<RestSourceConfig>) -> Result<HashMap<ValueKey, f64>> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .context("failed to build http client")?;

    let mut request = client.get(&config.url);
    for (name, value) in &config.headers {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("request to {} failed", config.url))?;
    let status = response.status();
    if !status.is_success() {
        bail!("{} answered {}", config.url, status);
    }
    let body = response
        .text()
        .await
        .with_context(|| format!("reading body from {} failed", config.url))?;

    let mut values = HashMap::new();
    for result in &config.results {
        let raw = extract::extract(&body, &result.extraction)
            .with_context(|| format!("extraction for result {} failed", result.result_id))?;
        values.insert(
            ValueKey::new(result.usage, result.result_id),
            apply_correction(raw, result.correction_factor, result.operator),
        );
    }
    Ok(values)
}

/// Builds one pull unit per configured REST endpoint.
pub struct RestAdapter {
    store: Arc<dyn SourceConfigStore>,
    history_capacity: usize,
}

impl RestAdapter {
    pub fn new(store: Arc<dyn SourceConfigStore>, history_capacity: usize) -> Self {
        Self {
            store,
            history_capacity,
        }
    }

    fn build_unit(&self, key: SourceKey, config: RestSourceConfig) -> SourceUnit {
        let interval = config.poll_interval;
        let config = Arc::new(config);
        let fetch_fn: Arc<FetchFn> = Arc::new(move |_token| {
            let config = config.clone();
            Box::pin(async move { fetch(config).await })
        });
        PolledSource::new(key, interval, self.history_capacity, fetch_fn).into()
    }
}

#[async_trait]
impl SourceAdapter for RestAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Rest
    }

    async fn build_units(&self, filter: &SourceFilter) -> Result<Vec<SourceUnit>> {
        let rows = self.store.sources(filter).await?;
        let units = rows
            .into_iter()
            .filter_map(|decoded| match decoded.row {
                crate::registry::SourceRow::Rest(config) => {
                    Some(self.build_unit(decoded.key, config))
                }
                _ => None,
            })
            .collect();
        Ok(units)
    }
}
