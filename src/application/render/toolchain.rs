//! Wrapper-script generation and execution of the external document toolchain.

use std::{
    fmt,
    fs::OpenOptions,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{debug, warn};

use crate::{application::pipeline::ToolchainConfig, infra::workspace::Workspace};

const SOURCE: &str = "application::render::toolchain";
const CHROOT_PROGRAM: &str = "chroot";
const SCRIPT_LANG: &str = "C.UTF-8";

#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("failed to write wrapper script `{path}`: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open job log `{path}`: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("toolchain program `{program}` unavailable: {source}")]
    NotFound {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to run toolchain program `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("workspace `{workspace}` is not inside chroot `{chroot}`")]
    OutsideChroot { workspace: PathBuf, chroot: PathBuf },
}

/// A shell script written into the workspace and executed by the toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperScript {
    name: String,
    commands: Vec<String>,
}

impl WrapperScript {
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Script body for a workspace seen at `directory` by the executing shell.
    pub fn render(&self, directory: &str, search_path: &str) -> String {
        let mut body = String::from("#!/bin/sh\n");
        body.push_str(&format!("export HOME={}\n", shell_quote(directory)));
        body.push_str(&format!("export PATH={}\n", shell_quote(search_path)));
        body.push_str(&format!("export LANG={SCRIPT_LANG}\n"));
        body.push_str(&format!("cd {} || exit 1\n", shell_quote(directory)));
        for command in &self.commands {
            body.push_str(command);
            body.push('\n');
        }
        body
    }
}

/// Runs wrapper scripts and reports their exit code.
#[async_trait]
pub trait Toolchain: Send + Sync + fmt::Debug {
    /// Execute `script` inside `workspace`, appending stdout and stderr to
    /// `log`. `None` means the process was terminated by a signal.
    async fn run(
        &self,
        workspace: &Workspace,
        script: &WrapperScript,
        log: &Path,
    ) -> Result<Option<i32>, ToolchainError>;
}

/// Spawns the configured shell, through `chroot` when a chroot is set.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    config: ToolchainConfig,
}

impl ProcessToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn run(
        &self,
        workspace: &Workspace,
        script: &WrapperScript,
        log: &Path,
    ) -> Result<Option<i32>, ToolchainError> {
        let started_at = Instant::now();
        let directory = path_in_environment(workspace.path(), self.config.chroot_dir.as_deref())?;
        let script_path = workspace.join(script.name());
        fs::write(
            &script_path,
            script.render(&directory.display().to_string(), &self.config.search_path),
        )
        .await
        .map_err(|source| ToolchainError::Script {
            path: script_path.clone(),
            source,
        })?;

        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(|source| ToolchainError::Log {
                path: log.to_path_buf(),
                source,
            })?;
        let stderr = stdout.try_clone().map_err(|source| ToolchainError::Log {
            path: log.to_path_buf(),
            source,
        })?;

        let script_in_environment = directory.join(script.name());
        let mut command = match &self.config.chroot_dir {
            Some(chroot) => {
                let mut command = Command::new(CHROOT_PROGRAM);
                command
                    .arg(chroot)
                    .arg(&self.config.shell)
                    .arg(&script_in_environment);
                command
            }
            None => {
                let mut command = Command::new(&self.config.shell);
                command.arg(&script_in_environment);
                command
            }
        };
        let program = match &self.config.chroot_dir {
            Some(_) => CHROOT_PROGRAM.to_string(),
            None => self.config.shell.display().to_string(),
        };

        debug!(
            target = SOURCE,
            identifier = %workspace.identifier(),
            script = script.name(),
            program = %program,
            "spawning toolchain"
        );

        let status = command
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| {
                warn!(
                    target = SOURCE,
                    identifier = %workspace.identifier(),
                    script = script.name(),
                    program = %program,
                    error = %source,
                    "failed to spawn toolchain"
                );
                if source.kind() == ErrorKind::NotFound {
                    ToolchainError::NotFound {
                        program: program.clone(),
                        source,
                    }
                } else {
                    ToolchainError::Spawn {
                        program: program.clone(),
                        source,
                    }
                }
            })?;

        debug!(
            target = SOURCE,
            identifier = %workspace.identifier(),
            script = script.name(),
            exit_code = status.code().map(i64::from).unwrap_or(-1),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "toolchain finished"
        );
        Ok(status.code())
    }
}

/// Where the workspace appears to the executing shell.
pub fn path_in_environment(
    workspace: &Path,
    chroot: Option<&Path>,
) -> Result<PathBuf, ToolchainError> {
    let Some(chroot) = chroot else {
        return Ok(workspace.to_path_buf());
    };
    let relative = workspace
        .strip_prefix(chroot)
        .map_err(|_| ToolchainError::OutsideChroot {
            workspace: workspace.to_path_buf(),
            chroot: chroot.to_path_buf(),
        })?;
    Ok(Path::new("/").join(relative))
}

/// The Pandoc invocation with cross-references and the given template.
///
/// `standalone` produces LaTeX for the compare flow instead of a PDF.
pub fn pandoc_command(
    config: &ToolchainConfig,
    template: &str,
    input: &str,
    output: &str,
    standalone: bool,
) -> String {
    let mut command = format!(
        "{} --filter pandoc-crossref --pdf-engine={} --template={}",
        config.pandoc,
        config.latex_engine,
        shell_quote(template)
    );
    if standalone {
        command.push_str(" --standalone");
    }
    command.push_str(
        " -M figPrefix=Figure -M tblPrefix=Table -M secPrefix=Section \
         -M autoSectionLabels=true --highlight-style=tango",
    );
    command.push_str(&format!(" {} -o {}", shell_quote(input), shell_quote(output)));
    command
}

/// `latexdiff` followed by two engine passes so cross-references settle.
pub fn diff_commands(config: &ToolchainConfig, old: &str, new: &str, diff_stem: &str) -> Vec<String> {
    let diff_tex = format!("{diff_stem}.tex");
    let engine = format!(
        "{} -interaction=nonstopmode {}",
        config.latex_engine,
        shell_quote(&diff_tex)
    );
    vec![
        format!(
            "{} --type=UNDERLINE {} {} > {}",
            config.latexdiff,
            shell_quote(old),
            shell_quote(new),
            shell_quote(&diff_tex)
        ),
        engine.clone(),
        engine,
    ]
}

/// Single-quote `value` for `/bin/sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
