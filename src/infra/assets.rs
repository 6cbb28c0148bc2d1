//! Embedded static asset serving utilities.

use std::borrow::Cow;

use axum::{
    body::Body,
    extract::Path,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use include_dir::{Dir, include_dir};
use mime_guess::{Mime, MimeGuess};

use crate::application::error::ErrorReport;

static STATIC_ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/static");

const INDEX_PAGE: &str = "index.html";
const STYLESHEET: &str = "style.css";

/// Serve the upload page.
pub async fn serve_index() -> Response {
    serve_named(INDEX_PAGE, "infra::assets::serve_index")
}

/// Serve the page stylesheet under both `/style` and `/style.css`.
pub async fn serve_stylesheet() -> Response {
    serve_named(STYLESHEET, "infra::assets::serve_stylesheet")
}

/// Serve any other embedded asset below `/static/`.
pub async fn serve_static(path: Option<Path<String>>) -> Response {
    let captured = path.map(|Path(value)| value);
    match resolve_asset(&STATIC_ASSETS, captured) {
        Ok(Some(asset)) => asset.into_response(),
        Ok(None) => not_found_response("infra::assets::serve_static"),
        Err(status) => rejected_response("infra::assets::serve_static", status),
    }
}

fn serve_named(name: &str, source: &'static str) -> Response {
    match resolve_asset(&STATIC_ASSETS, Some(name.to_string())) {
        Ok(Some(asset)) => asset.into_response(),
        Ok(None) => not_found_response(source),
        Err(status) => rejected_response(source, status),
    }
}

fn not_found_response(source: &'static str) -> Response {
    let mut response = StatusCode::NOT_FOUND.into_response();
    ErrorReport::from_message(source, StatusCode::NOT_FOUND, "Static asset not found")
        .attach(&mut response);
    response
}

fn rejected_response(source: &'static str, status: StatusCode) -> Response {
    let mut response = status.into_response();
    ErrorReport::from_message(source, status, "Static asset request rejected")
        .attach(&mut response);
    response
}

struct Asset<'a> {
    contents: Cow<'a, [u8]>,
    mime: MimeGuess,
}

fn resolve_asset(
    bundle: &'static Dir<'static>,
    path: Option<String>,
) -> Result<Option<Asset<'static>>, StatusCode> {
    let candidate = path.unwrap_or_default();
    let candidate = candidate.trim_start_matches('/');

    if candidate.is_empty() || candidate.ends_with('/') {
        return Ok(None);
    }
    if candidate.contains("..") {
        return Err(StatusCode::BAD_REQUEST);
    }

    let Some(file) = bundle.get_file(candidate) else {
        return Ok(None);
    };

    Ok(Some(Asset {
        contents: Cow::Borrowed(file.contents()),
        mime: mime_guess::from_path(candidate),
    }))
}

impl IntoResponse for Asset<'static> {
    fn into_response(self) -> Response {
        let mime = self.mime.first_or_octet_stream();
        match self.contents {
            Cow::Borrowed(slice) => build_response(Bytes::from_static(slice), mime),
            Cow::Owned(bytes) => build_response(Bytes::from(bytes), mime),
        }
    }
}

fn build_response(bytes: Bytes, mime: Mime) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_page_and_stylesheet_resolve() {
        let index = resolve_asset(&STATIC_ASSETS, Some(INDEX_PAGE.to_string()))
            .expect("accepted")
            .expect("index present");
        assert_eq!(index.mime.first_or_octet_stream(), mime_guess::mime::TEXT_HTML);

        let style = resolve_asset(&STATIC_ASSETS, Some(format!("/{STYLESHEET}")))
            .expect("accepted")
            .expect("stylesheet present");
        assert_eq!(style.mime.first_or_octet_stream(), mime_guess::mime::TEXT_CSS);
    }

    #[test]
    fn traversal_is_rejected_and_unknown_is_missing() {
        assert_eq!(
            resolve_asset(&STATIC_ASSETS, Some("../Cargo.toml".to_string())).err(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert!(matches!(
            resolve_asset(&STATIC_ASSETS, Some("missing.js".to_string())),
            Ok(None)
        ));
    }
}
