use std::{os::unix::fs::MetadataExt, process, sync::Arc};

use md2pdf::{
    application::{
        error::AppError, fetch::FetchResolver, pipeline::PipelineConfig,
        render::ProcessToolchain, retention::RetentionReaper, submission::SubmissionService,
    },
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        workspace::WorkspaceRoot,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Check => run_check(&settings),
    }
}

fn run_check(settings: &config::Settings) -> Result<(), AppError> {
    let pipeline = PipelineConfig::from(settings);
    println!("{settings:#?}");
    for name in &pipeline.static_content {
        match pipeline.locate_static(name) {
            Some(path) => println!("static content `{name}`: {}", path.display()),
            None => println!("static content `{name}`: MISSING"),
        }
    }
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let pipeline = Arc::new(PipelineConfig::from(&settings));
    warn_if_unprivileged(&pipeline);
    check_static_content(&pipeline);

    let root = WorkspaceRoot::new(settings.workspace.temp_root.clone()).map_err(InfraError::from)?;
    let swept = root.sweep_stale().await.map_err(InfraError::from)?;
    if swept > 0 {
        warn!(
            target = "md2pdf::serve",
            swept,
            "deleted workspaces left over from a previous run"
        );
    }
    let reaper = RetentionReaper::new();
    let toolchain = Arc::new(ProcessToolchain::new(pipeline.toolchain.clone()));
    let submissions = SubmissionService::new(
        Arc::clone(&pipeline),
        root.clone(),
        toolchain,
        reaper.clone(),
    )
    .map_err(InfraError::from)?;

    let state = HttpState {
        submissions: Arc::new(submissions),
        fetch: Arc::new(FetchResolver::new(root)),
    };
    let upload_body_limit = settings.uploads.max_request_bytes.get() as usize;
    let router = http::build_router(state, upload_body_limit);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "md2pdf::serve",
        addr = %settings.server.addr,
        temp_root = %settings.workspace.temp_root.display(),
        retention_secs = settings.workspace.retention.as_secs(),
        "listening for uploads"
    );

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    if tokio::time::timeout(settings.server.graceful_shutdown, reaper.wait_idle())
        .await
        .is_err()
    {
        warn!(
            target = "md2pdf::serve",
            rendering = reaper.rendering(),
            "renders still running at the shutdown deadline"
        );
    }
    let removed = reaper.shutdown().await;
    info!(
        target = "md2pdf::serve",
        removed,
        "retention reaper drained"
    );

    served
}

/// `chroot` needs root; without a chroot the service runs fine unprivileged.
fn warn_if_unprivileged(pipeline: &PipelineConfig) {
    let Some(chroot) = pipeline.toolchain.chroot_dir.as_ref() else {
        return;
    };
    match std::fs::metadata("/proc/self") {
        Ok(meta) if meta.uid() == 0 => {}
        Ok(meta) => warn!(
            target = "md2pdf::serve",
            uid = meta.uid(),
            chroot = %chroot.display(),
            "not running as root; chrooted renders will fail"
        ),
        Err(err) => warn!(
            target = "md2pdf::serve",
            error = %err,
            "could not determine the effective user"
        ),
    }
}

fn check_static_content(pipeline: &PipelineConfig) {
    for name in pipeline.missing_static_content() {
        error!(
            target = "md2pdf::serve",
            asset = name,
            static_dir = %pipeline.static_dir.display(),
            "static file is not accessible"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target = "md2pdf::serve", "shutdown signal received");
}
