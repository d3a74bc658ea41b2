use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use handoff_crypto::{CryptoError, SessionKey};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileStreamError {
    #[error("file write failed: {0}")]
    Write(#[from] io::Error),
    #[error("slice decrypt failed: {0}")]
    Decrypt(#[from] CryptoError),
    #[error("file stream {0} is already closed")]
    InvalidState(Uuid),
}

/// Path a file with `id` is stored under inside `dir`. Shared by the sender's
/// attachment lookup and the receiver's reconstruction.
pub fn file_path(dir: &Path, id: &Uuid) -> PathBuf {
    dir.join(id.hyphenated().to_string())
}

/// Reassembles one file from its sealed slices, in order.
pub struct FileStream {
    id: Uuid,
    key: SessionKey,
    path: PathBuf,
    output: Option<BufWriter<File>>,
    written: u64,
}

impl FileStream {
    pub fn create(id: Uuid, key: SessionKey, dir: &Path) -> Result<Self, FileStreamError> {
        let path = file_path(dir, &id);
        let output = BufWriter::new(File::create(&path)?);
        Ok(Self {
            id,
            key,
            path,
            output: Some(output),
            written: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_none()
    }

    /// Decrypt one slice and append it.
    pub fn write(&mut self, sealed: &[u8]) -> Result<(), FileStreamError> {
        let output = self
            .output
            .as_mut()
            .ok_or(FileStreamError::InvalidState(self.id))?;
        let plaintext = handoff_crypto::open(self.key.aes(), sealed)?;
        output.write_all(&plaintext)?;
        self.written += plaintext.len() as u64;
        Ok(())
    }

    /// Flush and release the output. Succeeds exactly once.
    pub fn close(&mut self) -> Result<PathBuf, FileStreamError> {
        let output = self.output.take().ok_or(FileStreamError::InvalidState(self.id))?;
        let file = output.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(self.path.clone())
    }
}
