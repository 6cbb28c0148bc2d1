use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{application::error::ErrorReport, domain::types::JobIdentifier};

const SOURCE: &str = "md2pdf::http::response";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// The digest an upload or fetch was about, as the client sent it.
#[derive(Debug, Clone)]
pub struct JobDigest(pub String);

impl JobDigest {
    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

impl From<&JobIdentifier> for JobDigest {
    fn from(identifier: &JobIdentifier) -> Self {
        Self(identifier.to_string())
    }
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

/// Log failed requests with their diagnostic chain, and every request that
/// touched a job with its digest.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis();
    let digest = response
        .extensions_mut()
        .remove::<JobDigest>()
        .map(|JobDigest(value)| value);

    if !status.is_client_error() && !status.is_server_error() {
        if let Some(digest) = digest {
            info!(
                target = SOURCE,
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                digest = %digest,
                request_id = request_id,
                "job request served",
            );
        }
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());
    let digest = digest.unwrap_or_default();

    if status.is_server_error() {
        error!(
            target = SOURCE,
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = elapsed_ms,
            source = source,
            detail = %detail,
            chain = ?messages,
            digest = %digest,
            request_id = request_id,
            "request failed",
        );
    } else {
        warn!(
            target = SOURCE,
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = elapsed_ms,
            source = source,
            detail = %detail,
            chain = ?messages,
            digest = %digest,
            request_id = request_id,
            "client request error",
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        http::StatusCode,
        middleware,
        response::IntoResponse,
        routing::get,
    };
    use tower::ServiceExt;

    async fn with_digest() -> Response {
        let mut response = StatusCode::OK.into_response();
        JobDigest("ab".repeat(32)).attach(&mut response);
        response
    }

    async fn failing_with_digest() -> Response {
        let mut response = StatusCode::NOT_FOUND.into_response();
        JobDigest("cd".repeat(32)).attach(&mut response);
        ErrorReport::from_message("test", StatusCode::NOT_FOUND, "missing").attach(&mut response);
        response
    }

    fn router() -> Router {
        Router::new()
            .route("/ok", get(with_digest))
            .route("/missing", get(failing_with_digest))
            .layer(middleware::from_fn(log_responses))
            .layer(middleware::from_fn(set_request_context))
    }

    async fn call(uri: &str) -> Response {
        router()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    #[tokio::test]
    async fn digest_and_report_are_consumed_by_the_log() {
        let ok = call("/ok").await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(ok.extensions().get::<JobDigest>().is_none());
        assert!(ok.extensions().get::<RequestContext>().is_some());

        let missing = call("/missing").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert!(missing.extensions().get::<JobDigest>().is_none());
        assert!(missing.extensions().get::<ErrorReport>().is_none());
    }

    #[test]
    fn digest_is_taken_from_the_identifier() {
        let identifier = JobIdentifier::from_bytes(b"archive");
        let JobDigest(value) = JobDigest::from(&identifier);
        assert_eq!(value, identifier.as_str());
    }
}
