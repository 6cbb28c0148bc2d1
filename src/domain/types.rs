//! Shared domain enumerations and the content-derived job identifier.

use std::{fmt, str::FromStr};

use sha2::{Digest, Sha256};

use super::error::DomainError;

/// Length of a hex-encoded SHA-256 digest.
pub const IDENTIFIER_LEN: usize = 64;

/// Content-derived identifier of a submitted archive.
///
/// Always 64 lowercase hex characters. Identical archive bytes always produce
/// the same identifier, which doubles as the workspace directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobIdentifier(String);

impl JobIdentifier {
    /// Digest the full archive content.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_hasher(hasher)
    }

    /// Finish an incremental digest computed while streaming an upload.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobIdentifier {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() != IDENTIFIER_LEN {
            return Err(DomainError::validation(format!(
                "identifier must be {IDENTIFIER_LEN} hex characters, got {}",
                trimmed.len()
            )));
        }
        if !trimmed.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(DomainError::validation(
                "identifier must only contain hex characters",
            ));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a render job. There is no failed state: toolchain failures
/// only show up in the log artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Rendering,
    Diffing,
    Finalizing,
    Done,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Rendering => "rendering",
            JobState::Diffing => "diffing",
            JobState::Finalizing => "finalizing",
            JobState::Done => "done",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Rendering)
                | (JobState::Rendering, JobState::Diffing)
                | (JobState::Rendering, JobState::Finalizing)
                | (JobState::Diffing, JobState::Finalizing)
                | (JobState::Finalizing, JobState::Done)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of artifact a client can retrieve for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Pdf,
    Log,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Log => "log",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::Pdf => "application/pdf",
            ArtifactKind::Log => "text/plain; charset=utf-8",
        }
    }
}
