//! Spooling of uploaded archives to disk while computing their digest.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

use crate::domain::types::JobIdentifier;

/// Errors that can occur while spooling an upload.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("uploaded file exceeds configured body limit")]
    PayloadTooLarge {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded file stream failed")]
    PayloadStream {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("uploaded file is empty")]
    EmptyPayload,
    #[error("uploaded file size exceeds supported range")]
    SizeOverflow,
}

/// An upload written to a temporary file. The file is removed on drop.
#[derive(Debug)]
pub struct SpooledArchive {
    path: TempPath,
    identifier: JobIdentifier,
    size_bytes: u64,
}

impl SpooledArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identifier(&self) -> &JobIdentifier {
        &self.identifier
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// Writes uploads into temporary files under the workspace root.
#[derive(Debug, Clone)]
pub struct ArchiveSpool {
    directory: PathBuf,
}

impl ArchiveSpool {
    pub fn new(directory: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// Stream the payload to disk, hashing every chunk on the way.
    pub async fn spool_stream<S>(&self, stream: S) -> Result<SpooledArchive, SpoolError>
    where
        S: Stream<Item = Result<Bytes, SpoolError>>,
    {
        let named = tempfile::Builder::new()
            .prefix(".upload-")
            .suffix(".zip")
            .tempfile_in(&self.directory)?;
        let (std_file, path) = named.into_parts();
        let mut file = fs::File::from_std(std_file);
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            if chunk.is_empty() {
                continue;
            }

            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or(SpoolError::SizeOverflow)?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
        }

        file.flush().await?;
        drop(file);

        if total_bytes == 0 {
            return Err(SpoolError::EmptyPayload);
        }

        Ok(SpooledArchive {
            path,
            identifier: JobIdentifier::from_hasher(hasher),
            size_bytes: total_bytes,
        })
    }

    /// Spool a fully-buffered payload. Intended for tests and small archives.
    pub async fn spool(&self, data: Bytes) -> Result<SpooledArchive, SpoolError> {
        let stream = stream::once(async move { Ok::<_, SpoolError>(data) });
        self.spool_stream(stream).await
    }
}
