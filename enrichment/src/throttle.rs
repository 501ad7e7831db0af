//! Batched fan-out for services that do not rate limit themselves.

use crate::metrics_defs::FANOUT_BATCHES;
use serde_json::Value;
use shared::counter;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    Data(Value),
    Error(String),
}

/// Outcome of enriching one feature
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentResult {
    pub identifier: String,
    pub enrichment: Enrichment,
}

/// Runs `worker` once per identifier, `limit` at a time.
///
/// Batch N starts only after every item of batch N-1 has completed, with `delay`
/// between batches. A failing or panicking item yields an error for that item only.
/// Results are in input order.
pub async fn run_throttled<F, Fut>(
    identifiers: Vec<String>,
    limit: usize,
    delay: Duration,
    worker: F,
) -> Vec<EnrichmentResult>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    let limit = limit.max(1);
    let batch_count = identifiers.len().div_ceil(limit);
    let mut results = Vec::with_capacity(identifiers.len());

    for (batch_index, batch) in identifiers.chunks(limit).enumerate() {
        let mut join_set = JoinSet::new();
        for (offset, identifier) in batch.iter().enumerate() {
            let task = worker(identifier.clone());
            join_set.spawn(async move { (offset, task.await) });
        }

        let mut slots: Vec<Option<Enrichment>> = (0..batch.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((offset, Ok(data))) => slots[offset] = Some(Enrichment::Data(data)),
                Ok((offset, Err(e))) => slots[offset] = Some(Enrichment::Error(e)),
                Err(e) => tracing::error!("Enrichment task failed: {e}"),
            }
        }

        results.extend(batch.iter().zip(slots).map(|(identifier, slot)| {
            EnrichmentResult {
                identifier: identifier.clone(),
                enrichment: slot.unwrap_or_else(|| Enrichment::Error("task failed".into())),
            }
        }));

        counter!(FANOUT_BATCHES).increment(1);
        tracing::debug!(batch = batch_index + 1, batch_count, "Enrichment batch complete");

        if batch_index + 1 < batch_count {
            sleep(delay).await;
        }
    }

    results
}
