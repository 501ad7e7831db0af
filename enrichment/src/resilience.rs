//! Bounded retries and failover between sources.

use crate::client::{FetchError, FetchOutcome, Params, SourceFetcher};
use crate::config::{FailurePolicy, SourceDescriptor};
use crate::metrics_defs::{FALLBACK_ACTIVATIONS, RETRY_ATTEMPTS, UPSTREAM_FETCH_FAILURES};
use indexmap::IndexMap;
use shared::counter;
use std::sync::Arc;
use tokio::time::sleep;

/// Fetches named sources according to their failure policy.
///
/// Cheap to clone; every clone shares the fetcher and the source table.
#[derive(Clone)]
pub struct ResilientFetcher {
    fetcher: Arc<dyn SourceFetcher>,
    sources: Arc<IndexMap<String, SourceDescriptor>>,
}

impl ResilientFetcher {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        sources: Arc<IndexMap<String, SourceDescriptor>>,
    ) -> Self {
        Self { fetcher, sources }
    }

    /// `fail_soft` sources get one attempt. `retry_then_fallback` sources get
    /// `retry.attempts` attempts spaced by `retry.delay_ms`, then the same treatment
    /// on the fallback source, whose outcome is returned as is.
    pub async fn fetch(&self, name: &str, params: &Params) -> FetchOutcome {
        let descriptor = self
            .sources
            .get(name)
            .ok_or_else(|| FetchError::UnknownSource(name.to_string()))?;

        if descriptor.policy == FailurePolicy::FailSoft {
            let outcome = self.fetcher.fetch(name, descriptor, params).await;
            if let Err(e) = &outcome {
                record_failure(name, e);
            }
            return outcome;
        }

        let primary_error = match self.fetch_with_retries(name, descriptor, params).await {
            Ok(body) => return Ok(body),
            Err(e) => e,
        };

        let Some(fallback_name) = &descriptor.fallback else {
            return Err(primary_error);
        };
        let fallback = self
            .sources
            .get(fallback_name)
            .ok_or_else(|| FetchError::UnknownSource(fallback_name.clone()))?;

        tracing::warn!(
            source = name,
            fallback = %fallback_name,
            "Primary source exhausted ({primary_error}), using fallback"
        );
        counter!(FALLBACK_ACTIVATIONS, "source" => name.to_string()).increment(1);

        self.fetch_with_retries(fallback_name, fallback, params).await
    }

    async fn fetch_with_retries(
        &self,
        name: &str,
        descriptor: &SourceDescriptor,
        params: &Params,
    ) -> FetchOutcome {
        let attempts = descriptor.retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            let e = match self.fetcher.fetch(name, descriptor, params).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };
            record_failure(name, &e);

            if attempt >= attempts || !e.is_retriable() {
                return Err(e);
            }

            tracing::debug!(
                source = name,
                attempt,
                attempts,
                "Attempt failed ({e}), retrying in {:?}",
                descriptor.retry.delay()
            );
            counter!(RETRY_ATTEMPTS, "source" => name.to_string()).increment(1);
            sleep(descriptor.retry.delay()).await;
            attempt += 1;
        }
    }
}

fn record_failure(name: &str, error: &FetchError) {
    tracing::debug!(source = name, "Fetch failed: {error}");
    counter!(UPSTREAM_FETCH_FAILURES, "source" => name.to_string()).increment(1);
}
