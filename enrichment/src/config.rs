use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Source `{0}` has an empty url")]
    EmptyUrl(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Unknown section: {0}")]
    UnknownSection(String),

    #[error("Duplicate section name: {0}")]
    DuplicateSection(String),

    #[error("Source `{0}` uses retry_then_fallback without a fallback")]
    MissingFallback(String),

    #[error("Fallback source `{0}` declares a fallback of its own")]
    FallbackChain(String),

    #[error("Source `{0}` must allow at least one attempt")]
    ZeroRetryAttempts(String),

    #[error("Enrichment batch size cannot be 0")]
    ZeroBatchSize,

    #[error("Merge `{0}` joins a field against itself")]
    SelfJoin(String),

    #[error("Environment variable `{0}` holding a source token is not set")]
    MissingCredential(String),
}

/// Enrichment service configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    /// Path of the lookup endpoint
    #[serde(default = "default_route")]
    pub route: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.pipeline.validate()
    }
}

fn default_route() -> String {
    "/api/get".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Timeouts {
    /// Applies to every outbound request, including body collection
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Upper bound for one whole pipeline run
    #[serde(default = "default_pipeline_deadline_secs")]
    pub pipeline_deadline_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_pipeline_deadline_secs() -> u64 {
    60
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            http_timeout_secs: default_http_timeout_secs(),
            pipeline_deadline_secs: default_pipeline_deadline_secs(),
        }
    }
}

/// How a failed section affects the rest of the run
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Failures are confined to their own envelope section
    #[default]
    Resilient,
    /// The first failed section fails the whole request
    Strict,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    #[default]
    Json,
    XmlAsText,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// One attempt; a failure becomes an error tag
    #[default]
    FailSoft,
    /// Bounded retries, then the declared fallback source
    RetryThenFallback,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default = "default_auth_header")]
    pub header: String,
    /// Prefix such as `Bearer`
    #[serde(default)]
    pub scheme: Option<String>,
    /// Environment variable the token is read from at startup
    pub token_env: String,
}

fn default_auth_header() -> String {
    "Authorization".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per stage, including the first one
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    3000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Static configuration of one external source
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SourceDescriptor {
    /// URL template; `{name}` placeholders are filled from request parameters
    pub url: String,
    #[serde(default)]
    pub format: BodyFormat,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Name of the source tried once retries on this one are exhausted
    #[serde(default)]
    pub fallback: Option<String>,
}

/// A section fetched straight from the lookup key
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SectionSpec {
    pub section: String,
    pub source: String,
}

/// Where a dependent section takes its centre point from
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum PointOrigin {
    /// A `POINT(x y)` text inside an independent section, addressed by JSON pointer
    Section { section: String, pointer: String },
    /// The centre of the caller's area
    Area,
}

/// A section whose request needs a point derived from earlier results
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DependentSpec {
    pub section: String,
    pub source: String,
    pub point: PointOrigin,
    /// Half-width of the `bbox` parameter built around the point
    #[serde(default = "default_bbox_buffer")]
    pub bbox_buffer: f64,
}

fn default_bbox_buffer() -> f64 {
    1.0
}

fn default_area_buffer() -> f64 {
    50.0
}

/// Per-feature fan-out against an identifier endpoint
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EnrichmentSpec {
    /// Section the identifier map is published under, if any
    #[serde(default)]
    pub section: Option<String>,
    /// Section holding the feature collection to enrich
    pub collection: String,
    /// Property read from each feature; also the URL template parameter name
    #[serde(default = "default_identifier_field")]
    pub id_field: String,
    pub source: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl EnrichmentSpec {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

fn default_identifier_field() -> String {
    "identificatie".into()
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_delay_ms() -> u64 {
    500
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    KeepUnmatched,
    #[default]
    DropUnmatched,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Replace the record's geometry with the matched feature's geometry
    #[default]
    Geometry,
    /// Copy the matched feature's properties under `attach_as`
    Properties,
}

/// Join of a primary collection against an index collection
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MergeSpec {
    #[serde(default = "default_merge_section")]
    pub section: String,
    /// Section whose features become merged records (address objects)
    pub primary: String,
    /// Section the lookup index is built from (building footprints)
    pub index: String,
    #[serde(default = "default_identifier_field")]
    pub index_key: String,
    #[serde(default = "default_join_field")]
    pub join_field: String,
    #[serde(default)]
    pub attach: AttachMode,
    #[serde(default = "default_attach_as")]
    pub attach_as: String,
    #[serde(default)]
    pub policy: MatchPolicy,
    /// Property the enrichment data is attached under
    #[serde(default = "default_label")]
    pub label: String,
}

fn default_merge_section() -> String {
    "MERGED".into()
}

fn default_join_field() -> String {
    "pandidentificatie".into()
}

fn default_attach_as() -> String {
    "pand".into()
}

fn default_label() -> String {
    "energielabel".into()
}

/// Declarative description of one enrichment pipeline
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: FailureMode,
    pub sources: IndexMap<String, SourceDescriptor>,
    /// Half-width of the `bbox` parameter when the caller's area is a point
    #[serde(default = "default_area_buffer")]
    pub area_buffer: f64,
    #[serde(default)]
    pub independent: Vec<SectionSpec>,
    #[serde(default)]
    pub dependent: Vec<DependentSpec>,
    #[serde(default)]
    pub enrichment: Option<EnrichmentSpec>,
    #[serde(default)]
    pub merge: Option<MergeSpec>,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, source) in &self.sources {
            if source.url.trim().is_empty() {
                return Err(ValidationError::EmptyUrl(name.clone()));
            }
            if source.retry.attempts == 0 {
                return Err(ValidationError::ZeroRetryAttempts(name.clone()));
            }
            match &source.fallback {
                Some(fallback) => {
                    let target = self
                        .sources
                        .get(fallback)
                        .ok_or_else(|| ValidationError::UnknownSource(fallback.clone()))?;
                    if target.fallback.is_some() {
                        return Err(ValidationError::FallbackChain(fallback.clone()));
                    }
                }
                None if source.policy == FailurePolicy::RetryThenFallback => {
                    return Err(ValidationError::MissingFallback(name.clone()));
                }
                None => {}
            }
        }

        let mut sections = HashSet::new();
        let mut fetched = HashSet::new();
        for spec in &self.independent {
            self.check_source(&spec.source)?;
            claim_section(&mut sections, &spec.section)?;
            fetched.insert(spec.section.as_str());
        }

        let independent: HashSet<&str> = fetched.clone();
        for spec in &self.dependent {
            self.check_source(&spec.source)?;
            claim_section(&mut sections, &spec.section)?;
            if let PointOrigin::Section { section, .. } = &spec.point {
                if !independent.contains(section.as_str()) {
                    return Err(ValidationError::UnknownSection(section.clone()));
                }
            }
            fetched.insert(spec.section.as_str());
        }

        if let Some(enrichment) = &self.enrichment {
            self.check_source(&enrichment.source)?;
            if !fetched.contains(enrichment.collection.as_str()) {
                return Err(ValidationError::UnknownSection(enrichment.collection.clone()));
            }
            if enrichment.batch_size == 0 {
                return Err(ValidationError::ZeroBatchSize);
            }
            if let Some(section) = &enrichment.section {
                claim_section(&mut sections, section)?;
            }
        }

        if let Some(merge) = &self.merge {
            for side in [&merge.primary, &merge.index] {
                if !fetched.contains(side.as_str()) {
                    return Err(ValidationError::UnknownSection(side.clone()));
                }
            }
            if merge.primary == merge.index && merge.join_field == merge.index_key {
                return Err(ValidationError::SelfJoin(merge.section.clone()));
            }
            claim_section(&mut sections, &merge.section)?;
        }

        Ok(())
    }

    fn check_source(&self, name: &str) -> Result<(), ValidationError> {
        if !self.sources.contains_key(name) {
            return Err(ValidationError::UnknownSource(name.to_string()));
        }
        Ok(())
    }
}

fn claim_section<'a>(
    sections: &mut HashSet<&'a str>,
    section: &'a str,
) -> Result<(), ValidationError> {
    if !sections.insert(section) {
        return Err(ValidationError::DuplicateSection(section.to_string()));
    }
    Ok(())
}

/// Source tokens, resolved once at process start.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    tokens: HashMap<String, String>,
}

impl Credentials {
    pub fn from_env(pipeline: &PipelineConfig) -> Result<Self, ValidationError> {
        Self::resolve(pipeline, |var| std::env::var(var).ok())
    }

    /// Resolves every `auth.token_env` through `lookup`.
    pub fn resolve<F>(pipeline: &PipelineConfig, lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut credentials = Credentials::default();
        for (name, source) in &pipeline.sources {
            if let Some(auth) = &source.auth {
                let token = lookup(&auth.token_env)
                    .filter(|token| !token.is_empty())
                    .ok_or_else(|| ValidationError::MissingCredential(auth.token_env.clone()))?;
                credentials.insert(name, token);
            }
        }
        Ok(credentials)
    }

    pub fn insert(&mut self, source: &str, token: String) {
        self.tokens.insert(source.to_string(), token);
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.tokens.get(source).map(String::as_str)
    }
}
