//! Inbound HTTP surface: one read-only lookup route plus a health check.

use crate::errors::{EnrichmentError, PipelineError};
use crate::lookup::LookupKey;
use crate::pipeline::Pipeline;
use http::{Method, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::http::{empty_response, error_response, json_response, text_response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

pub type ApiResponse = Response<BoxBody<Bytes, EnrichmentError>>;

pub struct EnrichmentService {
    pipeline: Pipeline,
    route: String,
}

impl EnrichmentService {
    pub fn new(pipeline: Pipeline, route: String) -> Self {
        Self { pipeline, route }
    }
}

impl Service<Request<Incoming>> for EnrichmentService {
    type Response = ApiResponse;
    type Error = EnrichmentError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let route = self.route.clone();
        let (parts, _body) = req.into_parts();

        Box::pin(async move {
            Ok(handle_request(&pipeline, &route, &parts.method, &parts.uri).await)
        })
    }
}

pub async fn handle_request(
    pipeline: &Pipeline,
    route: &str,
    method: &Method,
    uri: &Uri,
) -> ApiResponse {
    if method == Method::OPTIONS {
        return empty_response(StatusCode::OK);
    }

    let path = uri.path();
    if path == "/health" {
        if method != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        return text_response(StatusCode::OK, "ok\n");
    }
    if path != route {
        return error_response(StatusCode::NOT_FOUND, "not found");
    }
    if method != Method::GET {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let query: HashMap<String, String> = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let param = |name: &str| query.get(name).map(String::as_str);

    let key = match LookupKey::new(param("address_id"), param("object_id"), param("area")) {
        Ok(key) => key,
        Err(e) => return pipeline_error_response(&e),
    };

    match pipeline.run(&key).await {
        Ok(envelope) => match serde_json::to_value(&envelope) {
            Ok(body) => json_response(StatusCode::OK, &body),
            Err(e) => pipeline_error_response(&PipelineError::Internal(format!(
                "could not serialize envelope: {e}"
            ))),
        },
        Err(e) => pipeline_error_response(&e),
    }
}

fn pipeline_error_response(e: &PipelineError) -> ApiResponse {
    let status = e.status_code();
    if matches!(e, PipelineError::Internal(_)) {
        tracing::error!(error = ?e, "Pipeline fault");
    } else if status.is_server_error() {
        tracing::warn!("Pipeline failed: {e}");
    } else {
        tracing::debug!("Rejected lookup: {e}");
    }
    error_response(status, &e.public_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Body, FetchError};
    use crate::config::FailureMode;
    use crate::testutils::{ADDRESS_ID, AREA, OBJECT_ID, healthy_fetcher, scenario_pipeline};
    use http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            scenario_pipeline(),
            Arc::new(healthy_fetcher()),
            Duration::from_secs(10),
        )
    }

    async fn call(pipeline: &Pipeline, method: Method, uri: &str) -> (StatusCode, Bytes) {
        let uri: Uri = uri.parse().unwrap();
        let response = handle_request(pipeline, "/api/get", &method, &uri).await;
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    fn lookup_uri() -> String {
        format!("/api/get?address_id={ADDRESS_ID}&object_id={OBJECT_ID}&area={AREA}")
    }

    #[tokio::test]
    async fn test_lookup() {
        let (status, body) = call(&pipeline(), Method::GET, &lookup_uri()).await;

        assert_eq!(status, StatusCode::OK);
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["MERGED"].as_array().unwrap().len(), 3);
        assert_eq!(parsed["EPON"]["labelLetter"], "B");
    }

    #[tokio::test]
    async fn test_partial_failure_is_still_ok() {
        let pipeline = Pipeline::new(
            scenario_pipeline(),
            Arc::new(healthy_fetcher().always("kadaster", Err(FetchError::Status(502)))),
            Duration::from_secs(10),
        );

        let (status, body) = call(&pipeline, Method::GET, &lookup_uri()).await;

        assert_eq!(status, StatusCode::OK);
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            parsed["KADASTER"],
            json!({"error": "upstream returned status 502"})
        );
    }

    #[tokio::test]
    async fn test_options_short_circuits() {
        let (status, body) = call(&pipeline(), Method::OPTIONS, "/api/get").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_missing_parameter() {
        let uri = format!("/api/get?address_id={ADDRESS_ID}&object_id={OBJECT_ID}");
        let (status, body) = call(&pipeline(), Method::GET, &uri).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, json!({"error": "missing parameter: area"}));
    }

    #[tokio::test]
    async fn test_malformed_area() {
        let uri = format!("/api/get?address_id={ADDRESS_ID}&object_id={OBJECT_ID}&area=1%2C2%2C3");
        let (status, _) = call(&pipeline(), Method::GET, &uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_strict_failure_is_server_error() {
        let mut config = scenario_pipeline();
        config.mode = FailureMode::Strict;
        let pipeline = Pipeline::new(
            config,
            Arc::new(healthy_fetcher().always("netbeheer", Err(FetchError::Status(503)))),
            Duration::from_secs(10),
        );

        let (status, body) = call(&pipeline, Method::GET, &lookup_uri()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            parsed["error"],
            "section `NETBEHEER` failed: upstream returned status 503"
        );
    }

    #[tokio::test]
    async fn test_other_routes() {
        let pipeline = pipeline();

        let (status, body) = call(&pipeline, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), b"ok\n");

        let (status, _) = call(&pipeline, Method::GET, "/api/other").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&pipeline, Method::POST, &lookup_uri()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_text_section_is_returned_raw() {
        let pipeline = Pipeline::new(
            scenario_pipeline(),
            Arc::new(
                healthy_fetcher()
                    .always("epon", Err(FetchError::Status(503)))
                    .always("epon_wms", Ok(Body::Text("<FeatureInfo/>".into()))),
            ),
            Duration::from_secs(10),
        );

        let (status, body) = call(&pipeline, Method::GET, &lookup_uri()).await;

        assert_eq!(status, StatusCode::OK);
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["EPON"], "<FeatureInfo/>");
    }
}
