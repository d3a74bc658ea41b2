use crate::Database;
use handoff_types::models::*;
use handoff_types::{ItemKind, RecordSource, RecordStore, StoreError, TransferItem};

impl RecordStore for Database {
    fn insert_conversation(&self, record: &Conversation) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_participant(&self, record: &Participant) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_user(&self, record: &User) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_app(&self, record: &App) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_asset(&self, record: &Asset) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_snapshot(&self, record: &Snapshot) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_sticker(&self, record: &Sticker) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_pin_message(&self, record: &PinMessage) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_transcript_message(&self, record: &TranscriptMessage) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_message(&self, record: &Message) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_message_mention(&self, record: &MessageMention) -> Result<(), StoreError> {
        self.upsert(record)
    }

    fn insert_expired_message(&self, record: &ExpiredMessage) -> Result<(), StoreError> {
        self.upsert(record)
    }
}

impl RecordSource for Database {
    fn count(&self, kind: ItemKind) -> Result<u64, StoreError> {
        self.count_kind(kind)
    }

    fn page(
        &self,
        kind: ItemKind,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<TransferItem>, StoreError> {
        self.page_kind(kind, offset, limit)
    }
}
