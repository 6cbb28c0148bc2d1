//! Content-addressed admission: at most one workspace per archive digest.

use std::io;

use metrics::counter;
use thiserror::Error;
use tracing::info;

use crate::{
    domain::types::JobIdentifier,
    infra::workspace::{Workspace, WorkspaceRoot},
};

const SOURCE: &str = "application::admission";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to create workspace for {identifier}: {source}")]
    Workspace {
        identifier: JobIdentifier,
        #[source]
        source: io::Error,
    },
}

/// Result of admitting a digest.
#[derive(Debug)]
pub enum Admission {
    /// First submission of this content; the caller owns the fresh workspace.
    New(Workspace),
    /// A render for this content already ran or is running.
    Duplicate(JobIdentifier),
}

impl Admission {
    pub fn identifier(&self) -> &JobIdentifier {
        match self {
            Admission::New(workspace) => workspace.identifier(),
            Admission::Duplicate(identifier) => identifier,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Admission::New(_))
    }
}

/// Maps archive content to identifiers and workspaces.
///
/// The exclusive directory create is the only lock; there is no in-memory
/// registry, expiry or reference count.
#[derive(Debug, Clone)]
pub struct ContentAddressStore {
    root: WorkspaceRoot,
}

impl ContentAddressStore {
    pub fn new(root: WorkspaceRoot) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &WorkspaceRoot {
        &self.root
    }

    /// Digest the full archive and admit it.
    pub async fn admit(&self, bytes: &[u8]) -> Result<Admission, AdmissionError> {
        self.admit_identifier(&JobIdentifier::from_bytes(bytes))
            .await
    }

    /// Admit an identifier whose digest was computed while spooling.
    pub async fn admit_identifier(
        &self,
        identifier: &JobIdentifier,
    ) -> Result<Admission, AdmissionError> {
        match self.root.create_exclusive(identifier).await {
            Ok(workspace) => {
                info!(
                    target = SOURCE,
                    identifier = %identifier,
                    path = %workspace.path().display(),
                    "admitted new submission"
                );
                counter!("md2pdf_submissions_total", "outcome" => "new").increment(1);
                Ok(Admission::New(workspace))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                info!(
                    target = SOURCE,
                    identifier = %identifier,
                    "workspace already exists; treating as duplicate"
                );
                counter!("md2pdf_submissions_total", "outcome" => "duplicate").increment(1);
                Ok(Admission::Duplicate(identifier.clone()))
            }
            Err(source) => Err(AdmissionError::Workspace {
                identifier: identifier.clone(),
                source,
            }),
        }
    }
}
