//! Single outbound requests to external sources.
//!
//! A fetch never fails past this boundary: every transport problem, non-success
//! status or undecodable body comes back as a [`FetchError`] value.

use crate::config::{BodyFormat, Credentials, SourceDescriptor};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Values substituted into URL templates
pub type Params = BTreeMap<String, String>;

/// A fully decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    /// Raw text of an `xml_as_text` source
    Text(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            Body::Text(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Body::Json(value) => value,
            Body::Text(text) => Value::String(text),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),

    #[error("invalid url: {0}")]
    Template(String),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("undecodable body: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether re-issuing the identical request can change the outcome.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, FetchError::UnknownSource(_) | FetchError::Template(_))
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

pub type FetchOutcome = Result<Body, FetchError>;

/// Issues one request for a named source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, name: &str, descriptor: &SourceDescriptor, params: &Params)
    -> FetchOutcome;
}

/// Fills the `{name}` placeholders of `template`.
///
/// Values are form-encoded so caller input cannot add query parameters.
pub fn render_url(template: &str, params: &Params) -> Result<Url, FetchError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| FetchError::Template(format!("unclosed placeholder in `{template}`")))?;
        let name = &after[..end];
        let value = params
            .get(name)
            .ok_or_else(|| FetchError::Template(format!("no value for `{name}`")))?;
        rendered.extend(url::form_urlencoded::byte_serialize(value.as_bytes()));
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);

    Url::parse(&rendered).map_err(|e| FetchError::Template(format!("{rendered}: {e}")))
}

/// Decodes a successful body according to the declared format.
pub fn decode(format: BodyFormat, text: String) -> FetchOutcome {
    match format {
        BodyFormat::Json => serde_json::from_str(&text)
            .map(Body::Json)
            .map_err(|e| FetchError::Decode(format!("expected json: {e}"))),
        BodyFormat::XmlAsText => {
            let head = text.trim_start().to_ascii_lowercase();
            if !head.starts_with('<') {
                return Err(FetchError::Decode("expected xml".into()));
            }
            if head.starts_with("<!doctype html") || head.starts_with("<html") {
                return Err(FetchError::Decode("expected xml, got an html page".into()));
            }
            Ok(Body::Text(text))
        }
    }
}

fn content_type(format: BodyFormat) -> &'static str {
    match format {
        BodyFormat::Json => "application/json",
        BodyFormat::XmlAsText => "text/xml",
    }
}

/// [`SourceFetcher`] over HTTP
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    credentials: Credentials,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, credentials: Credentials) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpFetcher {
            client,
            credentials,
        })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(
        &self,
        name: &str,
        descriptor: &SourceDescriptor,
        params: &Params,
    ) -> FetchOutcome {
        let url = render_url(&descriptor.url, params)?;
        tracing::debug!(source = name, %url, "Fetching");

        let mut request = self
            .client
            .get(url)
            .header(CONTENT_TYPE, content_type(descriptor.format))
            .header(ACCEPT, content_type(descriptor.format));

        if let Some(auth) = &descriptor.auth {
            match self.credentials.get(name) {
                Some(token) => {
                    let value = match &auth.scheme {
                        Some(scheme) => format!("{scheme} {token}"),
                        None => token.to_string(),
                    };
                    request = request.header(auth.header.as_str(), value);
                }
                None => tracing::warn!(source = name, "No token configured for source"),
            }
        }

        let response = request.send().await.map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let text = response.text().await.map_err(FetchError::from_reqwest)?;
        decode(descriptor.format, text)
    }
}
