//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::rewrite::{RewriteRule, RewriteRuleSet};

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "md2pdf";
const SYSTEM_CONFIG_BASENAME: &str = "/usr/local/share/md2pdf_webserver_config";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 9090;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_TEMP_PATH: &str = "/tmp";
const DEFAULT_RETENTION_SECS: u64 = 120;
const DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_STATIC_DIR: &str = "/usr/local/share/md2pdf_static";
const DEFAULT_STATIC_CONTENT: [&str; 3] = ["example.latex", "gear.eps", "building.eps"];
const DEFAULT_TEMPLATE: &str = "example.latex";
const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_PANDOC: &str = "pandoc";
const DEFAULT_LATEXDIFF: &str = "latexdiff";
const DEFAULT_LATEX_ENGINE: &str = "xelatex";
const DEFAULT_SEARCH_PATH: &str = "/usr/local/texlive/bin/x86_64-linux:/usr/local/bin:/usr/bin:/bin";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub workspace: WorkspaceSettings,
    pub uploads: UploadSettings,
    pub render: RenderSettings,
    pub compare: CompareSettings,
    pub jobs: JobsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub temp_root: PathBuf,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_request_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub static_dir: PathBuf,
    pub static_content: Vec<String>,
    pub default_template: String,
    pub chroot_dir: Option<PathBuf>,
    pub shell: PathBuf,
    pub pandoc: String,
    pub latexdiff: String,
    pub latex_engine: String,
    pub search_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompareSettings {
    pub rules: RewriteRuleSet,
}

#[derive(Debug, Clone, Default)]
pub struct JobsSettings {
    pub max_concurrent_renders: Option<NonZeroUsize>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(SYSTEM_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("MD2PDF").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Check) | None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

/// Raw configuration tree.
///
/// The flat `listen_address`/`listen_port`/`temp_path`/`static_content`/
/// `default_template` keys are what the YAML file written by earlier
/// deployments contains; sectioned keys win when both are present.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    workspace: RawWorkspaceSettings,
    uploads: RawUploadSettings,
    render: RawRenderSettings,
    compare: RawCompareSettings,
    jobs: RawJobsSettings,
    listen_address: Option<String>,
    listen_port: Option<u16>,
    temp_path: Option<PathBuf>,
    static_content: Option<Vec<String>>,
    default_template: Option<String>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.listen.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.server.port = Some(port);
        }
        if let Some(path) = overrides.tempdir.as_ref() {
            self.workspace.temp_path = Some(path.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(limit) = overrides.max_concurrent_renders {
            self.jobs.max_concurrent_renders = Some(limit);
        }
    }

    fn fold_legacy_keys(&mut self) {
        if self.server.host.is_none() {
            self.server.host = self.listen_address.take();
        }
        if self.server.port.is_none() {
            self.server.port = self.listen_port.take();
        }
        if self.workspace.temp_path.is_none() {
            self.workspace.temp_path = self.temp_path.take();
        }
        if self.render.static_content.is_none() {
            self.render.static_content = self.static_content.take();
        }
        if self.render.default_template.is_none() {
            self.render.default_template = self.default_template.take();
        }
    }
}

impl Settings {
    fn from_raw(mut raw: RawSettings) -> Result<Self, LoadError> {
        raw.fold_legacy_keys();
        let RawSettings {
            server,
            logging,
            workspace,
            uploads,
            render,
            compare,
            jobs,
            ..
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let workspace = build_workspace_settings(workspace)?;
        let uploads = build_upload_settings(uploads)?;
        let render = build_render_settings(render)?;
        let compare = build_compare_settings(compare)?;
        let jobs = build_jobs_settings(jobs)?;

        if let Some(chroot) = render.chroot_dir.as_ref()
            && !workspace.temp_root.starts_with(chroot)
        {
            return Err(LoadError::invalid(
                "workspace.temp_path",
                format!(
                    "`{}` must live inside render.chroot_dir `{}`",
                    workspace.temp_root.display(),
                    chroot.display()
                ),
            ));
        }

        Ok(Self {
            server,
            logging,
            workspace,
            uploads,
            render,
            compare,
            jobs,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_workspace_settings(
    workspace: RawWorkspaceSettings,
) -> Result<WorkspaceSettings, LoadError> {
    let temp_root = workspace
        .temp_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_PATH));
    if temp_root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "workspace.temp_path",
            "path must not be empty",
        ));
    }

    let retention_secs = workspace
        .retention_seconds
        .unwrap_or(DEFAULT_RETENTION_SECS);
    if retention_secs == 0 {
        return Err(LoadError::invalid(
            "workspace.retention_seconds",
            "must be greater than zero",
        ));
    }

    Ok(WorkspaceSettings {
        temp_root,
        retention: Duration::from_secs(retention_secs),
    })
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let max_request_bytes_value = uploads
        .max_request_bytes
        .unwrap_or(DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES);
    let max_request_bytes = NonZeroU64::new(max_request_bytes_value).ok_or_else(|| {
        LoadError::invalid("uploads.max_request_bytes", "must be greater than zero")
    })?;
    usize::try_from(max_request_bytes_value).map_err(|_| {
        LoadError::invalid(
            "uploads.max_request_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(UploadSettings { max_request_bytes })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let static_dir = render
        .static_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_DIR));

    let static_content = render.static_content.unwrap_or_else(|| {
        DEFAULT_STATIC_CONTENT
            .iter()
            .map(|value| value.to_string())
            .collect()
    });
    if static_content.iter().any(|name| name.trim().is_empty()) {
        return Err(LoadError::invalid(
            "render.static_content",
            "entries must not be empty",
        ));
    }

    let default_template = non_empty(render.default_template, DEFAULT_TEMPLATE);

    let chroot_dir = render
        .chroot_dir
        .filter(|path| !path.as_os_str().is_empty());
    if let Some(dir) = chroot_dir.as_ref()
        && !dir.is_absolute()
    {
        return Err(LoadError::invalid(
            "render.chroot_dir",
            "path must be absolute",
        ));
    }

    let shell = render
        .shell
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
    if shell.as_os_str().is_empty() {
        return Err(LoadError::invalid("render.shell", "path must not be empty"));
    }

    Ok(RenderSettings {
        static_dir,
        static_content,
        default_template,
        chroot_dir,
        shell,
        pandoc: non_empty(render.pandoc, DEFAULT_PANDOC),
        latexdiff: non_empty(render.latexdiff, DEFAULT_LATEXDIFF),
        latex_engine: non_empty(render.latex_engine, DEFAULT_LATEX_ENGINE),
        search_path: non_empty(render.path, DEFAULT_SEARCH_PATH),
    })
}

fn build_compare_settings(compare: RawCompareSettings) -> Result<CompareSettings, LoadError> {
    let rules = compare
        .replace
        .into_iter()
        .map(|rule| {
            RewriteRule::new(rule.search, rule.replace)
                .map_err(|err| LoadError::invalid("compare.replace", err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompareSettings {
        rules: RewriteRuleSet::new(rules),
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let max_concurrent_renders = match jobs.max_concurrent_renders {
        Some(value) => Some(NonZeroUsize::new(value).ok_or_else(|| {
            LoadError::invalid("jobs.max_concurrent_renders", "must be greater than zero")
        })?),
        None => None,
    };

    Ok(JobsSettings {
        max_concurrent_renders,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkspaceSettings {
    temp_path: Option<PathBuf>,
    retention_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    static_dir: Option<PathBuf>,
    static_content: Option<Vec<String>>,
    default_template: Option<String>,
    chroot_dir: Option<PathBuf>,
    shell: Option<PathBuf>,
    pandoc: Option<String>,
    latexdiff: Option<String>,
    latex_engine: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompareSettings {
    replace: Vec<RawRewriteRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRewriteRule {
    search: String,
    #[serde(default)]
    replace: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    max_concurrent_renders: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty(value: Option<String>, default: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}
