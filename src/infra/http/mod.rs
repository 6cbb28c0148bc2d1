mod fetch;
mod middleware;
mod public;
mod upload;

pub use middleware::{JobDigest, RequestContext};
pub use public::{HttpState, build_router};

use axum::http::StatusCode;

use crate::{
    application::{error::HttpError, submission::SubmissionError},
    infra::uploads::SpoolError,
};

pub(crate) const HASHSUM_COOKIE: &str = "hashsum";

/// Map a submission failure to a consistent HTTP error response.
pub fn submission_error_to_http(source: &'static str, err: SubmissionError) -> HttpError {
    let (status, message) = match &err {
        SubmissionError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, err.to_string()),
        SubmissionError::MissingFile => (
            StatusCode::BAD_REQUEST,
            "No file was uploaded in the `ufile` field".to_string(),
        ),
        SubmissionError::Spool(SpoolError::PayloadTooLarge { .. } | SpoolError::SizeOverflow) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            "Uploaded file exceeds the configured size limit".to_string(),
        ),
        SubmissionError::Spool(SpoolError::EmptyPayload) => {
            (StatusCode::BAD_REQUEST, "Uploaded file is empty".to_string())
        }
        SubmissionError::Spool(SpoolError::PayloadStream { .. }) => (
            StatusCode::BAD_REQUEST,
            "Upload form data was invalid".to_string(),
        ),
        SubmissionError::Spool(SpoolError::Io(_))
        | SubmissionError::Admission(_)
        | SubmissionError::Ingest(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not process uploaded file, please retry later".to_string(),
        ),
    };
    HttpError::from_error(source, status, message, &err)
}
