//! The aggregation orchestrator.
//!
//! A run moves through fixed stages, each a barrier for the next:
//!
//! 1. **Validate**: the area must parse before anything is fetched.
//! 2. **Independent**: sections keyed only by the lookup key, fetched concurrently.
//! 3. **Dependent**: a point is derived for every dependent section (from an
//!    independent section or the area), then those sections are fetched concurrently.
//! 4. **Enrichment**: throttled per-feature fan-out over one collection.
//! 5. **Join**: the primary collection is merged with the index collection and the
//!    enrichment results.
//! 6. **Assemble**: every section lands in the envelope, errors included.
//!
//! In resilient mode a failed section only affects itself and the steps that need
//! its output. In strict mode the first failed section fails the run and in-flight
//! siblings are aborted.

use crate::client::{Body, FetchOutcome, Params, SourceFetcher};
use crate::config::{EnrichmentSpec, FailureMode, MergeSpec, PipelineConfig, PointOrigin};
use crate::derive::{DeriveError, parse_area, point_at, point_params};
use crate::envelope::{ResponseEnvelope, Section};
use crate::errors::{PipelineError, Result};
use crate::feature::FeatureCollection;
use crate::join::{Attach, attach_enrichment, build_index, index_enrichment, merge};
use crate::lookup::LookupKey;
use crate::metrics_defs::{MERGED_RECORDS, PIPELINE_DURATION, PIPELINE_RUNS};
use crate::resilience::ResilientFetcher;
use crate::throttle::{Enrichment, EnrichmentResult, run_throttled};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::timeout;

struct SectionRequest {
    section: String,
    source: String,
    params: Params,
}

type Outcomes = IndexMap<String, FetchOutcome>;

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    fetcher: ResilientFetcher,
    deadline: Duration,
}

impl Pipeline {
    /// `config` is expected to have passed [`PipelineConfig::validate`].
    pub fn new(config: PipelineConfig, fetcher: Arc<dyn SourceFetcher>, deadline: Duration) -> Self {
        let sources = Arc::new(config.sources.clone());
        Self {
            config: Arc::new(config),
            fetcher: ResilientFetcher::new(fetcher, sources),
            deadline,
        }
    }

    pub async fn run(&self, key: &LookupKey) -> Result<ResponseEnvelope> {
        let started = Instant::now();

        let result = match timeout(self.deadline, self.run_stages(key)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded(self.deadline)),
        };

        let outcome = match &result {
            Ok(envelope) if envelope.error_count() == 0 => "complete",
            Ok(_) => "partial",
            Err(e) if e.status_code().is_client_error() => "rejected",
            Err(_) => "failed",
        };
        counter!(PIPELINE_RUNS, "outcome" => outcome).increment(1);
        histogram!(PIPELINE_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            address_id = %key.address_id,
            object_id = %key.object_id,
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );

        result
    }

    async fn run_stages(&self, key: &LookupKey) -> Result<ResponseEnvelope> {
        let area = parse_area(&key.area)?;
        let mut base = key.params();
        base.extend(area.params(self.config.area_buffer));

        let requests = self
            .config
            .independent
            .iter()
            .map(|spec| SectionRequest {
                section: spec.section.clone(),
                source: spec.source.clone(),
                params: base.clone(),
            })
            .collect();
        let mut outcomes = self.fetch_sections(requests).await?;

        // Every point is derived before any dependent request goes out
        let mut requests = Vec::new();
        let mut skipped = IndexMap::new();
        for spec in &self.config.dependent {
            let point = match &spec.point {
                PointOrigin::Area => area.center(),
                PointOrigin::Section { section, pointer } => match outcomes.get(section) {
                    Some(Ok(Body::Json(value))) => point_at(value, pointer)?,
                    Some(Ok(Body::Text(_))) => {
                        return Err(DeriveError::MalformedGeometry(format!(
                            "section `{section}` holds no structured data"
                        ))
                        .into());
                    }
                    Some(Err(e)) => {
                        skipped.insert(
                            spec.section.clone(),
                            format!("dependency `{section}` unavailable: {e}"),
                        );
                        continue;
                    }
                    None => {
                        return Err(PipelineError::Internal(format!(
                            "section `{section}` was never fetched"
                        )));
                    }
                },
            };

            let mut params = base.clone();
            params.extend(point_params(point, spec.bbox_buffer));
            requests.push(SectionRequest {
                section: spec.section.clone(),
                source: spec.source.clone(),
                params,
            });
        }
        outcomes.extend(self.fetch_sections(requests).await?);

        let enrichment = match &self.config.enrichment {
            Some(spec) => self.enrich(spec, &base, &outcomes).await,
            None => None,
        };

        let mut envelope = ResponseEnvelope::new();
        let fetched = self
            .config
            .independent
            .iter()
            .map(|spec| &spec.section)
            .chain(self.config.dependent.iter().map(|spec| &spec.section));
        for section in fetched {
            let entry = match (outcomes.get(section), skipped.get(section)) {
                (Some(Ok(body)), _) => Section::Data(body.clone().into_value()),
                (Some(Err(e)), _) => Section::error(e.to_string()),
                (None, Some(reason)) => Section::error(reason.clone()),
                (None, None) => Section::error("not fetched"),
            };
            envelope.insert(section.clone(), entry);
        }

        if let Some(spec) = &self.config.enrichment {
            if let Some(section) = &spec.section {
                let entry = match &enrichment {
                    Some(results) => Section::Data(enrichment_map(results)),
                    None => Section::error(format!("collection `{}` unavailable", spec.collection)),
                };
                envelope.insert(section.clone(), entry);
            }
        }

        if let Some(spec) = &self.config.merge {
            let entry = self.merge_section(spec, &outcomes, enrichment.as_deref());
            envelope.insert(spec.section.clone(), entry);
        }

        Ok(envelope)
    }

    /// Fetches a group of sections concurrently and returns them in request order.
    async fn fetch_sections(&self, requests: Vec<SectionRequest>) -> Result<Outcomes> {
        let order: Vec<String> = requests.iter().map(|r| r.section.clone()).collect();
        let mut join_set = JoinSet::new();

        for request in requests {
            let fetcher = self.fetcher.clone();
            join_set.spawn(async move {
                let outcome = fetcher.fetch(&request.source, &request.params).await;
                (request.section, outcome)
            });
        }

        let mut completed = IndexMap::with_capacity(order.len());
        while let Some(joined) = join_set.join_next().await {
            let (section, outcome) = joined
                .map_err(|e| PipelineError::Internal(format!("section task failed: {e}")))?;

            if let Err(e) = &outcome {
                tracing::warn!(section = %section, "Section fetch failed: {e}");
                if self.config.mode == FailureMode::Strict {
                    // Dropping the join set aborts the sections still in flight
                    return Err(PipelineError::Upstream {
                        section,
                        reason: e.to_string(),
                    });
                }
            }
            completed.insert(section, outcome);
        }

        Ok(order
            .into_iter()
            .filter_map(|section| {
                completed
                    .swap_remove(&section)
                    .map(|outcome| (section, outcome))
            })
            .collect())
    }

    async fn enrich(
        &self,
        spec: &EnrichmentSpec,
        base: &Params,
        outcomes: &Outcomes,
    ) -> Option<Vec<EnrichmentResult>> {
        let Some(Ok(body)) = outcomes.get(&spec.collection) else {
            tracing::warn!(
                collection = %spec.collection,
                "Skipping enrichment, collection unavailable"
            );
            return None;
        };

        let identifiers = collection_of(body).identifiers(&spec.id_field);
        tracing::debug!(
            collection = %spec.collection,
            count = identifiers.len(),
            "Enriching features"
        );

        let results = run_throttled(
            identifiers,
            spec.batch_size,
            spec.batch_delay(),
            |identifier| {
                let fetcher = self.fetcher.clone();
                let source = spec.source.clone();
                let mut params = base.clone();
                params.insert(spec.id_field.clone(), identifier);
                async move {
                    fetcher
                        .fetch(&source, &params)
                        .await
                        .map(Body::into_value)
                        .map_err(|e| e.to_string())
                }
            },
        )
        .await;

        Some(results)
    }

    fn merge_section(
        &self,
        spec: &MergeSpec,
        outcomes: &Outcomes,
        enrichment: Option<&[EnrichmentResult]>,
    ) -> Section {
        let mut inputs = Vec::with_capacity(2);
        for side in [&spec.primary, &spec.index] {
            match outcomes.get(side) {
                Some(Ok(body)) => inputs.push(collection_of(body)),
                _ => return Section::error(format!("merge input `{side}` unavailable")),
            }
        }
        let (primary, index_source) = (&inputs[0], &inputs[1]);

        let index = build_index(index_source, &spec.index_key);
        let attach = Attach::new(spec.attach, &spec.attach_as);
        let mut records = merge(primary, &index, &spec.join_field, &attach, spec.policy);

        if let (Some(results), Some(enrichment_spec)) = (enrichment, &self.config.enrichment) {
            attach_enrichment(
                &mut records,
                &index_enrichment(results),
                &enrichment_spec.id_field,
                &spec.label,
            );
        }

        if records.is_empty() {
            tracing::warn!(
                section = %spec.section,
                primary = primary.len(),
                index = index_source.len(),
                "Merge produced no records"
            );
        }
        histogram!(MERGED_RECORDS).record(records.len() as f64);

        match serde_json::to_value(&records) {
            Ok(value) => Section::Data(value),
            Err(e) => Section::error(format!("could not serialize merged records: {e}")),
        }
    }
}

/// Non-json bodies hold no features.
fn collection_of(body: &Body) -> FeatureCollection {
    body.as_json()
        .map(FeatureCollection::from_value)
        .unwrap_or_default()
}

fn enrichment_map(results: &[EnrichmentResult]) -> Value {
    let mut map = Map::with_capacity(results.len());
    for result in results {
        let value = match &result.enrichment {
            Enrichment::Data(data) => data.clone(),
            Enrichment::Error(e) => json!({ "error": e }),
        };
        map.insert(result.identifier.clone(), value);
    }
    Value::Object(map)
}
