use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "md2pdf_submissions_total",
            Unit::Count,
            "Uploads handled, labelled by admission outcome."
        );
        describe_counter!(
            "md2pdf_renders_total",
            Unit::Count,
            "Render jobs that reached the done state, labelled by mode."
        );
        describe_histogram!(
            "md2pdf_render_ms",
            Unit::Milliseconds,
            "Wall-clock time spent in the external toolchain per job."
        );
        describe_counter!(
            "md2pdf_reaped_total",
            Unit::Count,
            "Workspace deletions attempted by the retention reaper."
        );
        describe_counter!(
            "md2pdf_fetch_total",
            Unit::Count,
            "Fetch requests, labelled by the artifact served."
        );
    });
}
