//! Upload orchestration: spool, admit, ingest, then hand off to a render job.

use std::{fmt, io, sync::Arc};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info};

use crate::{
    application::{
        admission::{Admission, AdmissionError, ContentAddressStore},
        ingest::{ArchiveIngestor, DocumentNotFound, IngestError},
        pipeline::PipelineConfig,
        render::{RenderJob, RenderOutcome, Toolchain},
        retention::RetentionReaper,
    },
    domain::{
        request::{RenderRequest, TemplateReference},
        types::JobIdentifier,
    },
    infra::{
        uploads::{ArchiveSpool, SpoolError, SpooledArchive},
        workspace::{Workspace, WorkspaceRoot},
    },
};

const SOURCE: &str = "application::submission";

/// Value the `x-method` header must carry.
pub const REQUIRED_METHOD: &str = "MD-to-PDF";

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(
        "This server only supports Markdown to PDF rendering, please check your request"
    )]
    MethodNotAllowed,
    #[error("request did not include an uploaded file")]
    MissingFile,
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("failed to prepare workspace: {0}")]
    Ingest(#[from] IngestError),
}

/// Reject requests whose `x-method` header is not [`REQUIRED_METHOD`].
pub fn require_method(header: Option<&str>) -> Result<(), SubmissionError> {
    match header {
        Some(value) if value.trim() == REQUIRED_METHOD => Ok(()),
        _ => Err(SubmissionError::MethodNotAllowed),
    }
}

/// Client-supplied options for one upload.
#[derive(Debug, Clone, Default)]
pub struct SubmissionRequest {
    pub filename: String,
    pub template: Option<String>,
    pub compare: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    Processing,
    AlreadySubmitted,
    DocumentNotFound(DocumentNotFound),
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::Processing => f.write_str(
                "File is being processed into a PDF, request it using the hash value",
            ),
            SubmissionStatus::AlreadySubmitted => f.write_str(
                "File has already been submitted, request the PDF using the hash value",
            ),
            SubmissionStatus::DocumentNotFound(DocumentNotFound::NoMarkdown) => {
                f.write_str("MD file not found in submitted archive")
            }
            SubmissionStatus::DocumentNotFound(reason) => {
                write!(f, "MD file not found in submitted archive: {reason}")
            }
        }
    }
}

/// What the client is told about its upload.
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub identifier: JobIdentifier,
    pub size_bytes: u64,
    pub filename: String,
    pub status: SubmissionStatus,
}

impl fmt::Display for SubmissionReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\nFile received\nlength: {}\nfilename: {}\nhash: {}\n{}\n",
            self.size_bytes, self.filename, self.identifier, self.status
        )
    }
}

/// A receipt plus the spawned render, when one was started.
#[derive(Debug)]
pub struct Submitted {
    pub receipt: SubmissionReceipt,
    pub render: Option<JoinHandle<Option<RenderOutcome>>>,
}

#[derive(Debug, Clone)]
pub struct SubmissionService {
    config: Arc<PipelineConfig>,
    spool: ArchiveSpool,
    store: ContentAddressStore,
    ingestor: ArchiveIngestor,
    toolchain: Arc<dyn Toolchain>,
    reaper: RetentionReaper,
    limiter: Option<Arc<Semaphore>>,
}

impl SubmissionService {
    pub fn new(
        config: Arc<PipelineConfig>,
        root: WorkspaceRoot,
        toolchain: Arc<dyn Toolchain>,
        reaper: RetentionReaper,
    ) -> Result<Self, io::Error> {
        let spool = ArchiveSpool::new(root.path().to_path_buf())?;
        let limiter = config
            .max_concurrent_renders
            .map(|limit| Arc::new(Semaphore::new(limit.get())));
        Ok(Self {
            ingestor: ArchiveIngestor::new(Arc::clone(&config)),
            store: ContentAddressStore::new(root),
            config,
            spool,
            toolchain,
            reaper,
            limiter,
        })
    }

    pub fn reaper(&self) -> &RetentionReaper {
        &self.reaper
    }

    /// Accept a fully-buffered archive.
    pub async fn submit(
        &self,
        request: SubmissionRequest,
        data: Bytes,
    ) -> Result<Submitted, SubmissionError> {
        let spooled = self.spool.spool(data).await?;
        self.accept(request, spooled).await
    }

    /// Accept an archive streamed from the client.
    pub async fn submit_stream<S>(
        &self,
        request: SubmissionRequest,
        stream: S,
    ) -> Result<Submitted, SubmissionError>
    where
        S: Stream<Item = Result<Bytes, SpoolError>>,
    {
        let spooled = self.spool.spool_stream(stream).await?;
        self.accept(request, spooled).await
    }

    async fn accept(
        &self,
        request: SubmissionRequest,
        spooled: SpooledArchive,
    ) -> Result<Submitted, SubmissionError> {
        let identifier = spooled.identifier().clone();
        let receipt = |status| SubmissionReceipt {
            identifier: identifier.clone(),
            size_bytes: spooled.size_bytes(),
            filename: request.filename.clone(),
            status,
        };

        let workspace = match self.store.admit_identifier(&identifier).await? {
            Admission::Duplicate(_) => {
                return Ok(Submitted {
                    receipt: receipt(SubmissionStatus::AlreadySubmitted),
                    render: None,
                });
            }
            Admission::New(workspace) => workspace,
        };

        let report = match self
            .ingestor
            .ingest(spooled.path(), &workspace, request.compare)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                self.schedule_retention(&workspace);
                return Err(err.into());
            }
        };

        let mode = match report.documents {
            Ok(mode) => mode,
            Err(reason) => {
                self.schedule_retention(&workspace);
                return Ok(Submitted {
                    receipt: receipt(SubmissionStatus::DocumentNotFound(reason)),
                    render: None,
                });
            }
        };

        let template = request
            .template
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(TemplateReference::parse)
            .unwrap_or_else(|| self.config.default_template.clone());
        info!(
            target = SOURCE,
            identifier = %identifier,
            filename = %request.filename,
            mode = mode.label(),
            template = ?template,
            "spawning render job"
        );

        let job = RenderJob::new(
            RenderRequest {
                identifier: identifier.clone(),
                template,
                mode,
            },
            workspace,
            Arc::clone(&self.config),
            Arc::clone(&self.toolchain),
        );
        let render = self.spawn(job);

        Ok(Submitted {
            receipt: receipt(SubmissionStatus::Processing),
            render: Some(render),
        })
    }

    fn spawn(&self, job: RenderJob) -> JoinHandle<Option<RenderOutcome>> {
        let reaper = self.reaper.clone();
        let limiter = self.limiter.clone();
        let retention = self.config.retention;
        let path = job.workspace().path().to_path_buf();
        let hold = reaper.hold(path.clone());
        tokio::spawn(async move {
            let outcome = match job.run(limiter).await {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    error!(
                        target = SOURCE,
                        path = %path.display(),
                        error = %err,
                        "render job aborted"
                    );
                    None
                }
            };
            reaper.schedule(path, retention);
            drop(hold);
            outcome
        })
    }

    fn schedule_retention(&self, workspace: &Workspace) {
        self.reaper
            .schedule(workspace.path().to_path_buf(), self.config.retention);
    }
}
