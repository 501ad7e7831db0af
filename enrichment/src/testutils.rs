use crate::client::{Body, FetchError, FetchOutcome, Params, SourceFetcher, render_url};
use crate::config::{
    BodyFormat, DependentSpec, EnrichmentSpec, FailureMode, FailurePolicy, MergeSpec,
    PipelineConfig, PointOrigin, RetryConfig, SectionSpec, SourceDescriptor,
};
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

type Responder = Box<dyn Fn(&Params, usize) -> FetchOutcome + Send + Sync>;

/// In-memory fetcher answering each source from a script.
///
/// The source's URL template is rendered first, like [`crate::client::HttpFetcher`]
/// does, so a missing parameter fails the call before the script is consulted.
#[derive(Default)]
pub struct ScriptedFetcher {
    responders: HashMap<String, Responder>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, Params)>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `responder` receives the request params and the zero-based call index for the source.
    pub fn with<F>(mut self, source: &str, responder: F) -> Self
    where
        F: Fn(&Params, usize) -> FetchOutcome + Send + Sync + 'static,
    {
        self.responders
            .insert(source.to_string(), Box::new(responder));
        self
    }

    pub fn always(self, source: &str, outcome: FetchOutcome) -> Self {
        self.with(source, move |_, _| outcome.clone())
    }

    /// Answers with `outcomes` in order, repeating the last one.
    pub fn sequence(self, source: &str, outcomes: Vec<FetchOutcome>) -> Self {
        assert!(!outcomes.is_empty());
        self.with(source, move |_, n| outcomes[n.min(outcomes.len() - 1)].clone())
    }

    pub fn with_delay(mut self, source: &str, delay: Duration) -> Self {
        self.delays.insert(source.to_string(), delay);
        self
    }

    pub fn calls(&self, source: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == source)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn params(&self, source: &str) -> Vec<Params> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == source)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        name: &str,
        descriptor: &SourceDescriptor,
        params: &Params,
    ) -> FetchOutcome {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.iter().filter(|(source, _)| source == name).count();
            calls.push((name.to_string(), params.clone()));
            index
        };

        render_url(&descriptor.url, params)?;

        if let Some(delay) = self.delays.get(name) {
            tokio::time::sleep(*delay).await;
        }

        match self.responders.get(name) {
            Some(responder) => responder(params, index),
            None => Err(FetchError::Transport(format!("no script for `{name}`"))),
        }
    }
}

pub fn source(url: &str) -> SourceDescriptor {
    SourceDescriptor {
        url: url.to_string(),
        format: BodyFormat::Json,
        auth: None,
        policy: FailurePolicy::FailSoft,
        retry: RetryConfig {
            attempts: 2,
            delay_ms: 10,
        },
        fallback: None,
    }
}

/// Address lookup, energy label with fallback, network zones, parcel, address
/// objects, buildings and a per-object label endpoint.
pub fn scenario_pipeline() -> PipelineConfig {
    let mut sources = IndexMap::new();
    sources.insert("bag".into(), source("https://bag.test/lookup?id={address_id}"));
    sources.insert(
        "epon".into(),
        SourceDescriptor {
            policy: FailurePolicy::RetryThenFallback,
            fallback: Some("epon_wms".into()),
            ..source("https://epon.test/labels/{object_id}")
        },
    );
    sources.insert(
        "epon_wms".into(),
        SourceDescriptor {
            format: BodyFormat::XmlAsText,
            ..source("https://wms.test/ows?bbox={bbox}")
        },
    );
    sources.insert("netbeheer".into(), source("https://zones.test/wfs?bbox={bbox}"));
    sources.insert("kadaster".into(), source("https://kadaster.test/wms?bbox={bbox}"));
    sources.insert("vbo".into(), source("https://vbo.test/items?x={x}&y={y}"));
    sources.insert("pand".into(), source("https://pand.test/items?bbox={bbox}"));
    sources.insert(
        "epon_by_id".into(),
        source("https://epon.test/labels/{identificatie}"),
    );

    let bag_point = || PointOrigin::Section {
        section: "BAG".into(),
        pointer: "/response/docs/0/centroide_rd".into(),
    };

    PipelineConfig {
        mode: FailureMode::Resilient,
        sources,
        area_buffer: 50.0,
        independent: vec![
            SectionSpec {
                section: "BAG".into(),
                source: "bag".into(),
            },
            SectionSpec {
                section: "EPON".into(),
                source: "epon".into(),
            },
            SectionSpec {
                section: "NETBEHEER".into(),
                source: "netbeheer".into(),
            },
        ],
        dependent: vec![
            DependentSpec {
                section: "KADASTER".into(),
                source: "kadaster".into(),
                point: bag_point(),
                bbox_buffer: 1.0,
            },
            DependentSpec {
                section: "VBO".into(),
                source: "vbo".into(),
                point: bag_point(),
                bbox_buffer: 1.0,
            },
            DependentSpec {
                section: "PAND".into(),
                source: "pand".into(),
                point: bag_point(),
                bbox_buffer: 50.0,
            },
        ],
        enrichment: Some(EnrichmentSpec {
            section: Some("LABELS".into()),
            collection: "VBO".into(),
            id_field: "identificatie".into(),
            source: "epon_by_id".into(),
            batch_size: 2,
            batch_delay_ms: 1,
        }),
        merge: Some(MergeSpec {
            section: "MERGED".into(),
            primary: "VBO".into(),
            index: "PAND".into(),
            index_key: "identificatie".into(),
            join_field: "pandidentificatie".into(),
            attach: Default::default(),
            attach_as: "pand".into(),
            policy: Default::default(),
            label: "energielabel".into(),
        }),
    }
}

pub const ADDRESS_ID: &str = "0363200000217585";
pub const OBJECT_ID: &str = "0363010000432080";
pub const AREA: &str = "121577,487350,121677,487450";

pub fn bag_body() -> Value {
    json!({
        "response": {
            "numFound": 1,
            "docs": [{
                "id": "adr-4b2f",
                "weergavenaam": "Damrak 1, 1012LG Amsterdam",
                "centroide_rd": "POINT(121627 487400)"
            }]
        }
    })
}

pub fn epon_body() -> Value {
    json!({"identificatie": OBJECT_ID, "labelLetter": "B"})
}

pub fn netbeheer_body() -> Value {
    json!({
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "geometry": {"type": "Polygon", "coordinates": []}, "properties": {"discipline": "Elektriciteit"}},
            {"type": "Feature", "geometry": {"type": "Polygon", "coordinates": []}, "properties": {"discipline": "Gas"}}
        ]
    })
}

pub fn kadaster_body() -> Value {
    json!({
        "type": "FeatureCollection",
        "features": [{"type": "Feature", "geometry": null, "properties": {"perceelnummer": 4122, "kadastraleGemeentecode": "ASD04"}}]
    })
}

pub fn vbo_feature(identificatie: &str, pand: &str) -> Value {
    json!({
        "type": "Feature",
        "geometry": {"type": "Point", "coordinates": [121627.0, 487400.0]},
        "properties": {"identificatie": identificatie, "pandidentificatie": pand}
    })
}

pub fn vbo_body() -> Value {
    json!({
        "type": "FeatureCollection",
        "features": [
            vbo_feature(OBJECT_ID, "0363100012168450"),
            vbo_feature("0363010000432081", "0363100012168450"),
            vbo_feature("0363010000999999", "0363100012000001")
        ]
    })
}

pub fn pand_geometry(n: u32) -> Value {
    json!({"type": "Polygon", "coordinates": [[[n, n], [n + 1, n], [n + 1, n + 1], [n, n]]]})
}

pub fn pand_body() -> Value {
    json!({
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "geometry": pand_geometry(1), "properties": {"identificatie": "0363100012168450", "bouwjaar": 1910}},
            {"type": "Feature", "geometry": pand_geometry(2), "properties": {"identificatie": "0363100012000001", "bouwjaar": 1985}}
        ]
    })
}

pub fn label_body(identificatie: &str) -> Value {
    json!({"identificatie": identificatie, "labelLetter": "C"})
}

/// Fetcher where every source of [`scenario_pipeline`] answers successfully.
pub fn healthy_fetcher() -> ScriptedFetcher {
    ScriptedFetcher::new()
        .always("bag", Ok(Body::Json(bag_body())))
        .always("epon", Ok(Body::Json(epon_body())))
        .always("netbeheer", Ok(Body::Json(netbeheer_body())))
        .always("kadaster", Ok(Body::Json(kadaster_body())))
        .always("vbo", Ok(Body::Json(vbo_body())))
        .always("pand", Ok(Body::Json(pand_body())))
        .with("epon_by_id", |params, _| {
            Ok(Body::Json(label_body(&params["identificatie"])))
        })
}

/// Request as seen by a [`TestUpstream`]
pub struct RecordedRequest {
    pub path: String,
    pub query: Option<String>,
    /// Lowercased header names
    pub headers: HashMap<String, String>,
}

pub struct TestUpstream {
    port: u16,
    requests: Arc<AtomicUsize>,
}

impl TestUpstream {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Serves `handler`'s `(status, body)` for every request on a local port.
pub async fn start_test_upstream<F>(handler: F) -> TestUpstream
where
    F: Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();

    let handler = Arc::new(handler);
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let handler = handler.clone();
            let counter = counter.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let recorded = RecordedRequest {
                            path: req.uri().path().to_string(),
                            query: req.uri().query().map(str::to_string),
                            headers: req
                                .headers()
                                .iter()
                                .filter_map(|(name, value)| {
                                    value
                                        .to_str()
                                        .ok()
                                        .map(|v| (name.as_str().to_string(), v.to_string()))
                                })
                                .collect(),
                        };
                        let (status, body) = handler(&recorded);
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() =
                            StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
                        Ok::<_, Infallible>(response)
                    }
                });

                if let Err(err) = Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    eprintln!("Error serving connection: {:?}", err);
                }
            });
        }
    });

    TestUpstream { port, requests }
}
