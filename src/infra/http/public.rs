use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    application::{fetch::FetchResolver, submission::SubmissionService},
    infra::assets,
};

use super::{
    fetch::{fetch_by_path, fetch_by_query},
    middleware::{log_responses, set_request_context},
    upload::upload,
};

#[derive(Clone)]
pub struct HttpState {
    pub submissions: Arc<SubmissionService>,
    pub fetch: Arc<FetchResolver>,
}

pub fn build_router(state: HttpState, upload_body_limit: usize) -> Router {
    Router::new()
        .route("/", get(assets::serve_index))
        .route("/style", get(assets::serve_stylesheet))
        .route("/style.css", get(assets::serve_stylesheet))
        .route("/static/{*path}", get(assets::serve_static))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route("/fetch", get(fetch_by_query))
        .route("/fetch/{digest}", get(fetch_by_path))
        .route("/_health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
