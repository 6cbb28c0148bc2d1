use std::io::ErrorKind;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use bytes::Bytes;
use serde::Deserialize;
use tracing::error;

use crate::application::{
    error::HttpError,
    fetch::{Artifact, FetchError},
};

use super::{HASHSUM_COOKIE, HttpState, middleware::JobDigest};

const SOURCE: &str = "infra::http::fetch";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct FetchQuery {
    hashsum: Option<String>,
}

/// `GET /fetch?hashsum=…`, falling back to the cookie set on upload.
pub(super) async fn fetch_by_query(
    State(state): State<HttpState>,
    Query(query): Query<FetchQuery>,
    jar: CookieJar,
) -> Response {
    let digest = query
        .hashsum
        .filter(|value| !value.trim().is_empty())
        .or_else(|| jar.get(HASHSUM_COOKIE).map(|cookie| cookie.value().to_string()))
        .unwrap_or_default();
    fetch(&state, digest.trim()).await
}

/// `GET /fetch/{digest}`.
pub(super) async fn fetch_by_path(
    State(state): State<HttpState>,
    Path(digest): Path<String>,
) -> Response {
    fetch(&state, digest.trim()).await
}

async fn fetch(state: &HttpState, digest: &str) -> Response {
    let mut response = serve_artifact(state, digest).await;
    if !digest.is_empty() {
        JobDigest(digest.to_string()).attach(&mut response);
    }
    response
}

async fn serve_artifact(state: &HttpState, digest: &str) -> Response {
    let artifact = match state.fetch.resolve_str(digest).await {
        Ok(artifact) => artifact,
        Err(FetchError::NotFound { .. }) => return not_found(digest),
        Err(err) => {
            error!(
                target = SOURCE,
                digest = %digest,
                error = %err,
                "failed to inspect workspace"
            );
            return HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read rendered file",
                &err,
            )
            .into_response();
        }
    };

    match tokio::fs::read(&artifact.path).await {
        Ok(bytes) => build_download_response(&artifact, Bytes::from(bytes)),
        // Reaped between resolution and read.
        Err(err) if err.kind() == ErrorKind::NotFound => not_found(digest),
        Err(err) => {
            error!(
                target = SOURCE,
                path = %artifact.path.display(),
                error = %err,
                "failed to read artifact"
            );
            HttpError::from_error(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read rendered file",
                &err,
            )
            .into_response()
        }
    }
}

fn not_found(digest: &str) -> Response {
    HttpError::new(
        SOURCE,
        StatusCode::NOT_FOUND,
        format!("No file was found for the given hashsum: {digest}"),
        "no artifact for digest",
    )
    .into_response()
}

fn build_download_response(artifact: &Artifact, bytes: Bytes) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(artifact.kind.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }

    let safe_name = artifact.file_name.replace('"', "'");
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{safe_name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    response
}
