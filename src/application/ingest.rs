//! Unpacking uploaded archives into workspaces and locating the documents.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::{
    application::pipeline::PipelineConfig, domain::request::RenderMode,
    infra::workspace::Workspace,
};

const SOURCE: &str = "application::ingest";
const NEW_MARKER: &str = "new";
const OLD_MARKER: &str = "old";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("archive could not be read: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("archive extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why no renderable document set was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentNotFound {
    NoMarkdown,
    MissingNew,
    MissingOld,
    AmbiguousNew(usize),
    AmbiguousOld(usize),
}

impl fmt::Display for DocumentNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentNotFound::NoMarkdown => f.write_str("no Markdown file in archive"),
            DocumentNotFound::MissingNew => {
                f.write_str("no Markdown file with `new` in its name")
            }
            DocumentNotFound::MissingOld => {
                f.write_str("no Markdown file with `old` in its name")
            }
            DocumentNotFound::AmbiguousNew(count) => {
                write!(f, "{count} Markdown files with `new` in their name")
            }
            DocumentNotFound::AmbiguousOld(count) => {
                write!(f, "{count} Markdown files with `old` in their name")
            }
        }
    }
}

pub type Documents = Result<RenderMode, DocumentNotFound>;

/// What ingestion did to a workspace.
#[derive(Debug)]
pub struct IngestReport {
    pub extracted_files: usize,
    pub staged_assets: usize,
    pub missing_assets: Vec<String>,
    pub archive_error: Option<String>,
    pub documents: Documents,
}

/// Unpacks archives and stages the shared template assets.
#[derive(Debug, Clone)]
pub struct ArchiveIngestor {
    config: Arc<PipelineConfig>,
}

impl ArchiveIngestor {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// Prepare `workspace` for rendering.
    ///
    /// A corrupt archive or a missing asset is logged and does not abort;
    /// the caller learns about it through [`IngestReport::documents`].
    pub async fn ingest(
        &self,
        archive: &Path,
        workspace: &Workspace,
        compare: bool,
    ) -> Result<IngestReport, IngestError> {
        let (extracted_files, archive_error) = match extract(archive, workspace.path()).await {
            Ok(count) => (count, None),
            Err(err) => {
                error!(
                    target = SOURCE,
                    identifier = %workspace.identifier(),
                    error = %err,
                    "error in zip extraction"
                );
                (0, Some(err.to_string()))
            }
        };

        let mut staged_assets = 0;
        let mut missing_assets = Vec::new();
        for name in &self.config.static_content {
            debug!(target = SOURCE, asset = %name, "staging static content");
            let Some(source) = self.config.locate_static(name) else {
                error!(
                    target = SOURCE,
                    identifier = %workspace.identifier(),
                    asset = %name,
                    static_dir = %self.config.static_dir.display(),
                    "static file is not accessible"
                );
                missing_assets.push(name.clone());
                continue;
            };
            let Some(file_name) = source.file_name() else {
                missing_assets.push(name.clone());
                continue;
            };
            match fs::copy(&source, workspace.join(file_name)).await {
                Ok(_) => staged_assets += 1,
                Err(err) => {
                    error!(
                        target = SOURCE,
                        identifier = %workspace.identifier(),
                        asset = %name,
                        error = %err,
                        "unable to copy static content"
                    );
                    missing_assets.push(name.clone());
                }
            }
        }

        workspace.remove_outputs().await?;

        let candidates = workspace.files_with_extension("md").await?;
        let documents = classify_documents(candidates, compare);
        match &documents {
            Ok(mode) => info!(
                target = SOURCE,
                identifier = %workspace.identifier(),
                mode = mode.label(),
                "found Markdown input"
            ),
            Err(reason) => warn!(
                target = SOURCE,
                identifier = %workspace.identifier(),
                reason = %reason,
                "no renderable Markdown input"
            ),
        }

        Ok(IngestReport {
            extracted_files,
            staged_assets,
            missing_assets,
            archive_error,
            documents,
        })
    }
}

/// Pick the documents to render from the top-level `*.md` files.
///
/// Single mode takes the first file in listing order. Compare mode needs
/// exactly one name containing `new` and one containing `old`; names that
/// contain both markers (or neither) are ignored.
pub fn classify_documents(candidates: Vec<PathBuf>, compare: bool) -> Documents {
    if !compare {
        return candidates
            .into_iter()
            .next()
            .map(|document| RenderMode::Single { document })
            .ok_or(DocumentNotFound::NoMarkdown);
    }

    if candidates.is_empty() {
        return Err(DocumentNotFound::NoMarkdown);
    }

    let mut new = Vec::new();
    let mut old = Vec::new();
    for path in candidates {
        let name = path
            .file_name()
            .map(|value| value.to_string_lossy().into_owned())
            .unwrap_or_default();
        match (name.contains(NEW_MARKER), name.contains(OLD_MARKER)) {
            (true, false) => new.push(path),
            (false, true) => old.push(path),
            _ => {}
        }
    }

    let new = exactly_one(new, DocumentNotFound::MissingNew, DocumentNotFound::AmbiguousNew)?;
    let old = exactly_one(old, DocumentNotFound::MissingOld, DocumentNotFound::AmbiguousOld)?;
    Ok(RenderMode::Compare { new, old })
}

fn exactly_one(
    mut paths: Vec<PathBuf>,
    missing: DocumentNotFound,
    ambiguous: fn(usize) -> DocumentNotFound,
) -> Result<PathBuf, DocumentNotFound> {
    match paths.len() {
        0 => Err(missing),
        1 => Ok(paths.remove(0)),
        count => Err(ambiguous(count)),
    }
}

async fn extract(archive: &Path, destination: &Path) -> Result<usize, IngestError> {
    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &destination)).await?
}

fn extract_blocking(archive: &Path, destination: &Path) -> Result<usize, IngestError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut extracted = 0;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(
                target = SOURCE,
                entry = %entry.name(),
                "skipping archive entry outside the workspace"
            );
            continue;
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut output = std::fs::File::create(&target)?;
        io::copy(&mut entry, &mut output)?;
        extracted += 1;
    }

    Ok(extracted)
}
