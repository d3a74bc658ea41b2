use thiserror::Error;

use crate::item::{ItemKind, TransferItem};
use crate::models::*;

/// Failure reported by the persistence collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store as a whole is unusable (disk full, read-only, corrupt).
    #[error("storage unavailable: {0}")]
    Systemic(String),
    /// This one record could not be written.
    #[error("record rejected: {0}")]
    Record(String),
}

impl StoreError {
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Systemic(_))
    }
}

/// Receiver-side sink: one idempotent insert per entity kind.
pub trait RecordStore: Send + Sync {
    fn insert_conversation(&self, record: &Conversation) -> Result<(), StoreError>;
    fn insert_participant(&self, record: &Participant) -> Result<(), StoreError>;
    fn insert_user(&self, record: &User) -> Result<(), StoreError>;
    fn insert_app(&self, record: &App) -> Result<(), StoreError>;
    fn insert_asset(&self, record: &Asset) -> Result<(), StoreError>;
    fn insert_snapshot(&self, record: &Snapshot) -> Result<(), StoreError>;
    fn insert_sticker(&self, record: &Sticker) -> Result<(), StoreError>;
    fn insert_pin_message(&self, record: &PinMessage) -> Result<(), StoreError>;
    fn insert_transcript_message(&self, record: &TranscriptMessage) -> Result<(), StoreError>;
    fn insert_message(&self, record: &Message) -> Result<(), StoreError>;
    fn insert_message_mention(&self, record: &MessageMention) -> Result<(), StoreError>;
    fn insert_expired_message(&self, record: &ExpiredMessage) -> Result<(), StoreError>;
}

/// Sender-side view of the local data set.
pub trait RecordSource: Send + Sync {
    fn count(&self, kind: ItemKind) -> Result<u64, StoreError>;

    /// Records of `kind` in stable order, `limit` at a time.
    fn page(&self, kind: ItemKind, offset: u64, limit: u32)
    -> Result<Vec<TransferItem>, StoreError>;
}
