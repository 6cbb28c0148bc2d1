//! Resolving a digest to the artifact a client can download.

use std::{io, path::PathBuf};

use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::{
    domain::types::{ArtifactKind, JobIdentifier},
    infra::workspace::{Workspace, WorkspaceRoot},
};

const SOURCE: &str = "application::fetch";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no artifact for {identifier}")]
    NotFound { identifier: String },
    #[error("failed to inspect workspace: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    pub fn not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            identifier: identifier.into(),
        }
    }
}

/// A file ready to be streamed back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub file_name: String,
}

/// Looks up finished output without waiting; callers poll.
#[derive(Debug, Clone)]
pub struct FetchResolver {
    root: WorkspaceRoot,
}

impl FetchResolver {
    pub fn new(root: WorkspaceRoot) -> Self {
        Self { root }
    }

    /// Parse client input and resolve it. Malformed digests are simply not found.
    pub async fn resolve_str(&self, raw: &str) -> Result<Artifact, FetchError> {
        let identifier = raw
            .parse::<JobIdentifier>()
            .map_err(|_| FetchError::not_found(raw))?;
        self.resolve(&identifier).await
    }

    /// The PDF if one exists, else the log.
    pub async fn resolve(&self, identifier: &JobIdentifier) -> Result<Artifact, FetchError> {
        let Some(workspace) = self.root.open(identifier).await? else {
            counter!("md2pdf_fetch_total", "artifact" => "none").increment(1);
            return Err(FetchError::not_found(identifier.as_str()));
        };

        for kind in [ArtifactKind::Pdf, ArtifactKind::Log] {
            if let Some(artifact) = first_artifact(&workspace, kind).await? {
                debug!(
                    target = SOURCE,
                    identifier = %identifier,
                    artifact = kind.extension(),
                    path = %artifact.path.display(),
                    "resolved artifact"
                );
                counter!("md2pdf_fetch_total", "artifact" => kind.extension()).increment(1);
                return Ok(artifact);
            }
        }

        counter!("md2pdf_fetch_total", "artifact" => "none").increment(1);
        Err(FetchError::not_found(identifier.as_str()))
    }
}

async fn first_artifact(
    workspace: &Workspace,
    kind: ArtifactKind,
) -> Result<Option<Artifact>, io::Error> {
    let mut candidates = workspace.files_with_extension(kind.extension()).await?;
    candidates.sort();
    Ok(candidates.into_iter().next().map(|path| {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.{}", workspace.identifier(), kind.extension()));
        Artifact {
            kind,
            path,
            file_name,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, FetchResolver, Workspace) {
        let dir = TempDir::new().expect("temp dir");
        let root = WorkspaceRoot::new(dir.path().to_path_buf()).expect("root");
        let workspace = root
            .create_exclusive(&JobIdentifier::from_bytes(b"fetch"))
            .await
            .expect("workspace");
        (dir, FetchResolver::new(root), workspace)
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_found() {
        let (_dir, resolver, _workspace) = setup().await;
        let err = resolver
            .resolve(&JobIdentifier::from_bytes(b"other"))
            .await
            .expect_err("missing");
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn workspace_without_output_is_not_found() {
        let (_dir, resolver, workspace) = setup().await;
        std::fs::write(workspace.join("doc.md"), "# doc").expect("write");
        let err = resolver
            .resolve(workspace.identifier())
            .await
            .expect_err("no output yet");
        assert!(matches!(err, FetchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn log_is_served_until_a_pdf_exists() {
        let (_dir, resolver, workspace) = setup().await;
        std::fs::write(workspace.join("doc.log"), "pandoc output").expect("write");

        let artifact = resolver.resolve(workspace.identifier()).await.expect("log");
        assert_eq!(artifact.kind, ArtifactKind::Log);
        assert_eq!(artifact.file_name, "doc.log");

        std::fs::write(workspace.join("doc.pdf"), "%PDF").expect("write");
        let artifact = resolver.resolve(workspace.identifier()).await.expect("pdf");
        assert_eq!(artifact.kind, ArtifactKind::Pdf);
        assert_eq!(artifact.path, workspace.join("doc.pdf"));
    }

    #[tokio::test]
    async fn first_pdf_by_name_wins() {
        let (_dir, resolver, workspace) = setup().await;
        std::fs::write(workspace.join("b.pdf"), "%PDF").expect("write");
        std::fs::write(workspace.join("a.pdf"), "%PDF").expect("write");

        let artifact = resolver.resolve(workspace.identifier()).await.expect("pdf");
        assert_eq!(artifact.file_name, "a.pdf");
    }

    #[tokio::test]
    async fn malformed_digests_are_not_found() {
        let (_dir, resolver, _workspace) = setup().await;
        for raw in ["", "../etc", "zz", &"a".repeat(65)] {
            let err = resolver.resolve_str(raw).await.expect_err("malformed");
            assert!(matches!(err, FetchError::NotFound { .. }), "input {raw:?}");
        }
    }
}
