use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use handoff_crypto::SessionKey;
use handoff_types::models::Message;
use handoff_types::{ItemKind, RecordSource, StoreError, TransferItem};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::file_stream::file_path;
use crate::protocol::{self, CodecError, MAX_SLICE_SIZE};

/// Records fetched from the store per query.
pub const PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("reading attachment {path}: {source}")]
    Attachment { path: PathBuf, source: io::Error },
}

/// Turns the local data set into encoded frame bodies, in transfer order.
pub struct DataSource {
    records: Arc<dyn RecordSource>,
    key: SessionKey,
    attachments_dir: Option<PathBuf>,
    slice_size: usize,
}

impl DataSource {
    pub fn new(
        records: Arc<dyn RecordSource>,
        key: SessionKey,
        attachments_dir: Option<PathBuf>,
        slice_size: usize,
    ) -> Self {
        Self {
            records,
            key,
            attachments_dir,
            slice_size: slice_size.clamp(1, MAX_SLICE_SIZE),
        }
    }

    /// Logical units the receiver will count: every record plus every
    /// attachment that will be streamed.
    pub fn total_count(&self) -> Result<u64, StoreError> {
        let mut total = 0;
        for kind in ItemKind::ALL {
            total += self.records.count(kind)?;
        }
        if self.attachments_dir.is_some() {
            self.for_each_page(ItemKind::Message, |items| {
                total += items
                    .iter()
                    .filter(|item| matches!(item, TransferItem::Message(m) if self.attachment(m).is_some()))
                    .count() as u64;
                ControlFlow::Continue(())
            })?;
        }
        Ok(total)
    }

    /// Feed every encoded frame to `sink`, stopping early if it breaks.
    pub fn enumerate<F>(&self, mut sink: F) -> Result<ControlFlow<()>, SourceError>
    where
        F: FnMut(Vec<u8>) -> ControlFlow<()>,
    {
        for kind in ItemKind::ALL {
            let mut offset = 0u64;
            loop {
                let items = self.records.page(kind, offset, PAGE_SIZE)?;
                if items.is_empty() {
                    break;
                }
                offset += items.len() as u64;

                for item in &items {
                    let payload = item.encode().map_err(|e| CodecError::Encode(e.to_string()))?;
                    let frame = protocol::encode_message(&payload, &self.key)?;
                    if sink(frame).is_break() {
                        return Ok(ControlFlow::Break(()));
                    }

                    if let TransferItem::Message(message) = item {
                        if let Some((id, path)) = self.attachment(message) {
                            if self.stream_file(id, &path, &mut sink)?.is_break() {
                                return Ok(ControlFlow::Break(()));
                            }
                        }
                    }
                }

                if items.len() < PAGE_SIZE as usize {
                    break;
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn for_each_page<F>(&self, kind: ItemKind, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&[TransferItem]) -> ControlFlow<()>,
    {
        let mut offset = 0u64;
        loop {
            let items = self.records.page(kind, offset, PAGE_SIZE)?;
            offset += items.len() as u64;
            if items.is_empty() || f(&items).is_break() || items.len() < PAGE_SIZE as usize {
                return Ok(());
            }
        }
    }

    /// Attachment file for `message`, if it has one on disk.
    fn attachment(&self, message: &Message) -> Option<(Uuid, PathBuf)> {
        let dir = self.attachments_dir.as_deref()?;
        if !message.has_media() {
            return None;
        }
        let Ok(id) = Uuid::parse_str(&message.message_id) else {
            warn!("Skipping attachment of message {}: id is not a UUID", message.message_id);
            return None;
        };
        let path = file_path(dir, &id);
        if path.is_file() {
            Some((id, path))
        } else {
            debug!("No attachment on disk for message {}", id);
            None
        }
    }

    fn stream_file<F>(&self, id: Uuid, path: &Path, sink: &mut F) -> Result<ControlFlow<()>, SourceError>
    where
        F: FnMut(Vec<u8>) -> ControlFlow<()>,
    {
        let attachment_err = |source| SourceError::Attachment {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(attachment_err)?;
        let mut remaining = file.metadata().map_err(attachment_err)?.len();
        let mut buf = vec![0u8; self.slice_size];

        // An empty file still goes out as one terminal slice.
        loop {
            let n = remaining.min(self.slice_size as u64) as usize;
            file.read_exact(&mut buf[..n]).map_err(attachment_err)?;
            remaining -= n as u64;

            let frame = protocol::encode_file_slice(id, remaining, &buf[..n], &self.key)?;
            if sink(frame).is_break() {
                return Ok(ControlFlow::Break(()));
            }
            if remaining == 0 {
                return Ok(ControlFlow::Continue(()));
            }
        }
    }
}
