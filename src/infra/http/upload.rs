use axum::{
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::{
    CookieJar, Multipart,
    cookie::Cookie,
    multipart::{Field, MultipartError, MultipartRejection},
};
use futures::StreamExt;
use tracing::{error, info};

use crate::{
    application::{
        error::HttpError,
        submission::{SubmissionError, SubmissionRequest, require_method},
    },
    infra::uploads::SpoolError,
};

use super::{HASHSUM_COOKIE, HttpState, middleware::JobDigest, submission_error_to_http};

const SOURCE: &str = "infra::http::upload";
const FILE_FIELD: &str = "ufile";
const METHOD_HEADER: &str = "x-method";
const TEMPLATE_HEADER: &str = "x-latex-template";
const COMPARE_HEADER: &str = "x-compare";
const DEFAULT_FILENAME: &str = "upload.zip";

pub(super) async fn upload(
    State(state): State<HttpState>,
    headers: HeaderMap,
    jar: CookieJar,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if let Err(err) = require_method(header_value(&headers, METHOD_HEADER)) {
        return submission_error_to_http(SOURCE, err).into_response();
    }

    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_REQUEST,
                "Upload must be sent as multipart form data",
                &rejection,
            )
            .into_response();
        }
    };

    let field = match file_field(&mut multipart).await {
        Ok(field) => field,
        Err(err) => return submission_error_to_http(SOURCE, err).into_response(),
    };

    let request = SubmissionRequest {
        filename: field
            .file_name()
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
        template: header_value(&headers, TEMPLATE_HEADER).map(str::to_string),
        compare: headers.contains_key(COMPARE_HEADER),
    };

    let stream = field.map(|result| result.map_err(spool_error));
    let submitted = match state.submissions.submit_stream(request, stream).await {
        Ok(submitted) => submitted,
        Err(err) => {
            error!(
                target = SOURCE,
                error = %err,
                "upload rejected"
            );
            return submission_error_to_http(SOURCE, err).into_response();
        }
    };

    let receipt = submitted.receipt;
    info!(
        target = SOURCE,
        identifier = %receipt.identifier,
        filename = %receipt.filename,
        size_bytes = receipt.size_bytes,
        status = %receipt.status,
        "upload received"
    );

    let cookie = Cookie::build((HASHSUM_COOKIE, receipt.identifier.to_string())).path("/");
    let mut response = (
        jar.add(cookie),
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        receipt.to_string(),
    )
        .into_response();
    JobDigest::from(&receipt.identifier).attach(&mut response);
    response
}

async fn file_field(multipart: &mut Multipart) -> Result<Field, SubmissionError> {
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(FILE_FIELD) => return Ok(field),
            Ok(Some(_)) => continue,
            Ok(None) => return Err(SubmissionError::MissingFile),
            Err(err) => return Err(SubmissionError::Spool(spool_error(err))),
        }
    }
}

fn spool_error(err: MultipartError) -> SpoolError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        SpoolError::PayloadTooLarge {
            source: Box::new(err),
        }
    } else {
        SpoolError::PayloadStream {
            source: Box::new(err),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
