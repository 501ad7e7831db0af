pub mod api;
pub mod client;
pub mod config;
pub mod derive;
pub mod envelope;
pub mod errors;
pub mod feature;
pub mod join;
pub mod lookup;
pub mod metrics_defs;
pub mod pipeline;
pub mod resilience;
pub mod throttle;

#[cfg(test)]
mod testutils;

use api::EnrichmentService;
use client::HttpFetcher;
use config::{Config, Credentials};
use errors::EnrichmentError;
use pipeline::Pipeline;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

/// Validates `config` and wires the pipeline to the HTTP source client.
pub fn build_pipeline(config: &Config, credentials: Credentials) -> Result<Pipeline, EnrichmentError> {
    config.validate()?;

    let fetcher = HttpFetcher::new(
        Duration::from_secs(config.timeouts.http_timeout_secs),
        credentials,
    )?;

    Ok(Pipeline::new(
        config.pipeline.clone(),
        Arc::new(fetcher),
        Duration::from_secs(config.timeouts.pipeline_deadline_secs),
    ))
}

pub async fn run(config: Config, credentials: Credentials) -> Result<(), EnrichmentError> {
    let pipeline = build_pipeline(&config, credentials)?;
    let service = EnrichmentService::new(pipeline, config.route.clone());

    tracing::info!(route = %config.route, "Starting enrichment service");
    run_http_service(&config.listener.host, config.listener.port, service).await
}
