//! The per-upload render state machine.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use tokio::{
    fs,
    io::AsyncWriteExt,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{info, warn};

use super::{
    markup::{fix_markup, rewrite},
    toolchain::{Toolchain, WrapperScript, diff_commands, pandoc_command, path_in_environment},
};
use crate::{
    application::pipeline::PipelineConfig,
    domain::{
        error::DomainError,
        request::{RenderMode, RenderRequest, TemplateReference},
        types::{JobIdentifier, JobState},
    },
    infra::workspace::Workspace,
};

const SOURCE: &str = "application::render::job";
const RENDER_SCRIPT: &str = ".md2pdf-render.sh";
const STAGE_ONE_SCRIPT: &str = ".md2pdf-stage1.sh";
const STAGE_TWO_SCRIPT: &str = ".md2pdf-stage2.sh";
const DIFF_SUFFIX: &str = "-diff";

/// Exit code of one wrapper script; `None` when killed by a signal or never
/// started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptExit {
    pub script: String,
    pub code: Option<i32>,
}

impl ScriptExit {
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

/// What a finished job left behind.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub identifier: JobIdentifier,
    pub mode: &'static str,
    pub pdf: Option<PathBuf>,
    pub log: PathBuf,
    pub exits: Vec<ScriptExit>,
    pub history: Vec<JobState>,
    pub elapsed: Duration,
}

/// Drives one workspace through `Queued → Rendering → (Diffing →) Finalizing → Done`.
#[derive(Debug)]
pub struct RenderJob {
    request: RenderRequest,
    workspace: Workspace,
    config: Arc<PipelineConfig>,
    toolchain: Arc<dyn Toolchain>,
    state: JobState,
    history: Vec<JobState>,
    exits: Vec<ScriptExit>,
}

impl RenderJob {
    pub fn new(
        request: RenderRequest,
        workspace: Workspace,
        config: Arc<PipelineConfig>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Self {
        Self {
            request,
            workspace,
            config,
            toolchain,
            state: JobState::Queued,
            history: vec![JobState::Queued],
            exits: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn advance(&mut self, next: JobState) -> Result<(), DomainError> {
        if !self.state.can_advance_to(next) {
            return Err(DomainError::illegal_transition(self.state, next));
        }
        info!(
            target = SOURCE,
            identifier = %self.request.identifier,
            from = self.state.as_str(),
            to = next.as_str(),
            "render job transition"
        );
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Run the job to completion.
    ///
    /// With a limiter the job waits in `Queued` for a permit. Toolchain and
    /// file failures are appended to the job log and never stop the job
    /// short of `Done`.
    pub async fn run(mut self, limiter: Option<Arc<Semaphore>>) -> Result<RenderOutcome, DomainError> {
        let _permit = acquire(limiter).await;
        let started_at = Instant::now();
        self.advance(JobState::Rendering)?;

        let mode = self.request.mode.clone();
        let (log, pdf) = match &mode {
            RenderMode::Single { document } => {
                let stem = file_stem(document);
                let log = self.workspace.join(format!("{stem}.log"));
                self.render_single(document, &stem, &log).await;
                (log, self.workspace.join(format!("{stem}.pdf")))
            }
            RenderMode::Compare { new, old } => {
                let new_stem = file_stem(new);
                let old_stem = file_stem(old);
                let log = self.workspace.join(format!("{new_stem}.log"));
                let diff_stem = format!("{new_stem}{DIFF_SUFFIX}");
                self.render_compare(new, old, &new_stem, &old_stem, &diff_stem, &log)
                    .await?;
                (log, self.workspace.join(format!("{diff_stem}.pdf")))
            }
        };

        self.advance(JobState::Finalizing)?;
        let pdf = fs::metadata(&pdf)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|_| pdf);
        let failed: Vec<&ScriptExit> = self.exits.iter().filter(|exit| !exit.succeeded()).collect();
        if !failed.is_empty() {
            warn!(
                target = SOURCE,
                identifier = %self.request.identifier,
                failed_scripts = ?failed,
                "toolchain reported failures; see job log"
            );
        }

        self.advance(JobState::Done)?;
        let elapsed = started_at.elapsed();
        counter!("md2pdf_renders_total", "mode" => mode.label()).increment(1);
        histogram!("md2pdf_render_ms").record(elapsed.as_secs_f64() * 1000.0);
        info!(
            target = SOURCE,
            identifier = %self.request.identifier,
            mode = mode.label(),
            pdf = pdf.is_some(),
            elapsed_ms = elapsed.as_millis() as u64,
            "render job finished"
        );

        Ok(RenderOutcome {
            identifier: self.request.identifier.clone(),
            mode: mode.label(),
            pdf,
            log,
            exits: self.exits,
            history: self.history,
            elapsed,
        })
    }

    async fn render_single(&mut self, document: &Path, stem: &str, log: &Path) {
        let template = self.template_argument();
        let script = WrapperScript::new(
            RENDER_SCRIPT,
            vec![pandoc_command(
                &self.config.toolchain,
                &template,
                &file_name(document),
                &format!("{stem}.pdf"),
                false,
            )],
        );
        self.execute(&script, log).await;
    }

    async fn render_compare(
        &mut self,
        new: &Path,
        old: &Path,
        new_stem: &str,
        old_stem: &str,
        diff_stem: &str,
        log: &Path,
    ) -> Result<(), DomainError> {
        for document in [new, old] {
            if let Err(err) = self.rewrite_in_place(document, rewrite_document).await {
                self.note_failure(log, &format!("rewrite of {}", document.display()), err.to_string())
                    .await;
            }
        }

        let template = self.template_argument();
        let new_tex = format!("{new_stem}.tex");
        let old_tex = format!("{old_stem}.tex");
        let stage_one = WrapperScript::new(
            STAGE_ONE_SCRIPT,
            vec![
                pandoc_command(
                    &self.config.toolchain,
                    &template,
                    &file_name(new),
                    &new_tex,
                    true,
                ),
                pandoc_command(
                    &self.config.toolchain,
                    &template,
                    &file_name(old),
                    &old_tex,
                    true,
                ),
            ],
        );
        self.execute(&stage_one, log).await;

        self.advance(JobState::Diffing)?;
        for tex in [&new_tex, &old_tex] {
            let path = self.workspace.join(tex);
            if let Err(err) = self.rewrite_in_place(&path, |text, _| fix_markup(text)).await {
                self.note_failure(log, &format!("markup fix-up of {tex}"), err.to_string())
                    .await;
            }
        }

        let stage_two = WrapperScript::new(
            STAGE_TWO_SCRIPT,
            diff_commands(&self.config.toolchain, &old_tex, &new_tex, diff_stem),
        );
        self.execute(&stage_two, log).await;
        Ok(())
    }

    fn template_argument(&self) -> String {
        let resolved = self
            .request
            .template
            .resolve(self.workspace.path(), &self.config.static_dir);
        if !resolved.available {
            warn!(
                target = SOURCE,
                identifier = %self.request.identifier,
                template = %resolved.argument,
                "template not found; passing it to the toolchain unchanged"
            );
        }
        self.template_in_environment(resolved.argument)
    }

    /// A named template found in the static directory is a host path. Inside a
    /// chroot it is rebased, or passed by bare name when the static directory
    /// lies outside the chroot.
    fn template_in_environment(&self, argument: String) -> String {
        let (TemplateReference::Named(name), Some(chroot)) = (
            &self.request.template,
            self.config.toolchain.chroot_dir.as_deref(),
        ) else {
            return argument;
        };
        if !Path::new(&argument).is_absolute() {
            return argument;
        }
        match path_in_environment(Path::new(&argument), Some(chroot)) {
            Ok(path) => path.display().to_string(),
            Err(_) => name.clone(),
        }
    }

    async fn rewrite_in_place(
        &self,
        path: &Path,
        transform: impl Fn(&str, &PipelineConfig) -> String,
    ) -> std::io::Result<()> {
        let text = fs::read_to_string(path).await?;
        fs::write(path, transform(&text, &self.config)).await
    }

    async fn execute(&mut self, script: &WrapperScript, log: &Path) {
        let code = match self.toolchain.run(&self.workspace, script, log).await {
            Ok(code) => code,
            Err(err) => {
                self.note_failure(log, script.name(), err.to_string()).await;
                None
            }
        };
        if code != Some(0) {
            warn!(
                target = SOURCE,
                identifier = %self.request.identifier,
                script = script.name(),
                exit_code = code.map(i64::from).unwrap_or(-1),
                "toolchain script exited unsuccessfully"
            );
        }
        self.exits.push(ScriptExit {
            script: script.name().to_string(),
            code,
        });
    }

    /// Log a failure and append it to the job log so the client can see it.
    async fn note_failure(&self, log: &Path, step: &str, error: String) {
        warn!(
            target = SOURCE,
            identifier = %self.request.identifier,
            step,
            error = %error,
            "render step failed"
        );
        let line = format!("md2pdf: {step} failed: {error}\n");
        let appended = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .await?;
            file.write_all(line.as_bytes()).await
        };
        if let Err(err) = appended.await {
            warn!(
                target = SOURCE,
                identifier = %self.request.identifier,
                log = %log.display(),
                error = %err,
                "failed to append to job log"
            );
        }
    }
}

fn rewrite_document(text: &str, config: &PipelineConfig) -> String {
    rewrite(text, &config.rewrite_rules)
}

async fn acquire(limiter: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    let semaphore = limiter?;
    semaphore.acquire_owned().await.ok()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
