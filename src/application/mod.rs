//! Application services: the content-addressed render pipeline.

pub mod admission;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod pipeline;
pub mod render;
pub mod retention;
pub mod submission;
