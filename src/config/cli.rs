use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the md2pdf binary.
#[derive(Debug, Parser)]
#[command(
    name = "md2pdf",
    version,
    about = "Web service rendering zipped Markdown into PDF via Pandoc and LaTeX"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "MD2PDF_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start the web service in the foreground.
    Serve(Box<ServeArgs>),
    /// Print the resolved configuration and check static content.
    Check,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Local IP address to listen on.
    #[arg(short = 'l', long = "listen", value_name = "ADDRESS")]
    pub listen: Option<String>,

    /// Port to listen on.
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Directory for received archives and rendered files.
    #[arg(
        short = 't',
        long = "tempdir",
        value_name = "DIRECTORY",
        value_hint = ValueHint::DirPath
    )]
    pub tempdir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Bound the number of renders running at once (unbounded when unset).
    #[arg(long = "jobs-max-concurrent-renders", value_name = "COUNT")]
    pub max_concurrent_renders: Option<usize>,
}
