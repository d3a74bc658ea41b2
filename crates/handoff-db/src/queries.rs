use crate::Database;
use handoff_types::{ItemKind, Record, StoreError, TransferItem};
use rusqlite::{Connection, ErrorCode, OptionalExtension};

impl Database {
    // -- Writes --

    /// Insert or overwrite one record by its key. Replaying the same record
    /// leaves the table unchanged apart from `updated_at`.
    pub fn upsert<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let body = serde_json::to_string(record).map_err(|e| StoreError::Record(e.to_string()))?;
        let key = record.key();
        let conn = self.lock().map_err(StoreError::Systemic)?;
        upsert_row(&conn, R::KIND, &key, &body).map_err(classify)
    }

    // -- Reads --

    pub fn count_kind(&self, kind: ItemKind) -> Result<u64, StoreError> {
        let conn = self.lock().map_err(StoreError::Systemic)?;
        conn.query_row(
            "SELECT COUNT(*) FROM records WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(classify)
    }

    pub fn page_kind(
        &self,
        kind: ItemKind,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<TransferItem>, StoreError> {
        let bodies = {
            let conn = self.lock().map_err(StoreError::Systemic)?;
            query_bodies(&conn, kind, offset, limit).map_err(classify)?
        };

        bodies
            .iter()
            .map(|body| {
                TransferItem::from_stored(kind, body).map_err(|e| StoreError::Record(e.to_string()))
            })
            .collect()
    }

    /// Fetch one record by key.
    pub fn get<R: Record>(&self, key: &str) -> anyhow::Result<Option<R>> {
        self.with_conn(|conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM records WHERE kind = ?1 AND id = ?2",
                    [R::KIND.as_str(), key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }
}

fn upsert_row(conn: &Connection, kind: ItemKind, key: &str, body: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO records (kind, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(kind, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        rusqlite::params![kind.as_str(), key, body, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn query_bodies(
    conn: &Connection,
    kind: ItemKind,
    offset: u64,
    limit: u32,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT body FROM records WHERE kind = ?1 ORDER BY rowid LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![kind.as_str(), limit as i64, offset as i64],
        |row| row.get(0),
    )?;
    rows.collect()
}

/// Split SQLite failures into ones that doom every subsequent write and
/// ones scoped to a single record.
pub(crate) fn classify(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::DiskFull
            | ErrorCode::ReadOnly
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase
            | ErrorCode::OutOfMemory,
        ) => StoreError::Systemic(err.to_string()),
        _ => StoreError::Record(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handoff_types::models::{Conversation, Message};

    fn message(id: &str, content: &str) -> Message {
        Message {
            message_id: id.into(),
            conversation_id: "c1".into(),
            user_id: "U1".into(),
            category: "PLAIN_TEXT".into(),
            content: Some(content.into()),
            media_url: None,
            media_mime_type: None,
            media_size: None,
            media_status: None,
            status: "DELIVERED".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            quote_message_id: None,
            caption: None,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&message("m1", "a")).unwrap();
        db.upsert(&message("m1", "a")).unwrap();
        assert_eq!(db.count_kind(ItemKind::Message).unwrap(), 1);

        db.upsert(&message("m1", "edited")).unwrap();
        let stored: Message = db.get("m1").unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("edited"));
    }

    #[test]
    fn kinds_are_separate_namespaces() {
        let db = Database::open_in_memory().unwrap();
        db.upsert(&message("x", "a")).unwrap();
        db.upsert(&Conversation {
            conversation_id: "x".into(),
            owner_id: None,
            category: None,
            name: None,
            icon_url: None,
            announcement: None,
            code_url: None,
            created_at: "t".into(),
            status: 0,
            mute_until: None,
            expire_in: None,
        })
        .unwrap();
        assert_eq!(db.count_kind(ItemKind::Message).unwrap(), 1);
        assert_eq!(db.count_kind(ItemKind::Conversation).unwrap(), 1);
        assert_eq!(db.count_kind(ItemKind::User).unwrap(), 0);
    }

    #[test]
    fn pages_follow_insertion_order() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            db.upsert(&message(&format!("m{i}"), "a")).unwrap();
        }
        // Updating an existing row must not move it to the end.
        db.upsert(&message("m0", "b")).unwrap();

        let first = db.page_kind(ItemKind::Message, 0, 2).unwrap();
        let rest = db.page_kind(ItemKind::Message, 2, 10).unwrap();
        let ids: Vec<String> = first
            .iter()
            .chain(rest.iter())
            .map(|item| match item {
                TransferItem::Message(m) => m.message_id.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, ["m0", "m1", "m2", "m3", "m4"]);
        assert!(db.page_kind(ItemKind::Message, 5, 10).unwrap().is_empty());
    }

    #[test]
    fn constraint_failures_are_record_scoped() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                Ok(conn
                    .execute("INSERT INTO records (kind, id) VALUES ('message', 'm')", [])
                    .map_err(classify))
            })
            .unwrap()
            .unwrap_err();
        assert!(!err.is_systemic());
    }

    #[test]
    fn read_only_database_is_systemic() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| Ok(conn.pragma_update(None, "query_only", true)?))
            .unwrap();

        let err = db.upsert(&message("m1", "a")).unwrap_err();
        assert!(err.is_systemic(), "{err:?}");
    }
}
