//! Sample data for trying a transfer between two local databases.

use anyhow::Result;
use chrono::{Duration, Utc};
use handoff_types::models::{Conversation, Message, Participant, User};
use tracing::info;
use uuid::Uuid;

use crate::Database;

/// Every Nth seeded message carries an attachment.
const MEDIA_EVERY: usize = 4;

impl Database {
    /// Write one conversation owned by `account_id` holding `count` messages.
    ///
    /// Returns the messages that reference an attachment; the caller decides
    /// where (and whether) to write their files.
    pub fn seed(&self, account_id: &str, count: usize) -> Result<Vec<Message>> {
        let now = Utc::now();
        let conversation_id = Uuid::new_v4().to_string();
        let peer_id = Uuid::new_v4().to_string();

        self.upsert(&User {
            user_id: peer_id.clone(),
            full_name: Some("Seed Peer".into()),
            identity_number: "7000".into(),
            avatar_url: None,
            relationship: "FRIEND".into(),
            biography: None,
            is_verified: Some(false),
            app_id: None,
            created_at: Some(now.to_rfc3339()),
        })?;

        self.upsert(&Conversation {
            conversation_id: conversation_id.clone(),
            owner_id: Some(account_id.to_string()),
            category: Some("CONTACT".into()),
            name: None,
            icon_url: None,
            announcement: None,
            code_url: None,
            created_at: now.to_rfc3339(),
            status: 2,
            mute_until: None,
            expire_in: None,
        })?;

        for user_id in [account_id, peer_id.as_str()] {
            self.upsert(&Participant {
                conversation_id: conversation_id.clone(),
                user_id: user_id.to_string(),
                role: String::new(),
                created_at: now.to_rfc3339(),
            })?;
        }

        let mut with_media = Vec::new();
        for i in 0..count {
            let has_media = i % MEDIA_EVERY == MEDIA_EVERY - 1;
            let message = Message {
                message_id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.clone(),
                user_id: if i % 2 == 0 { account_id.to_string() } else { peer_id.clone() },
                category: if has_media { "PLAIN_DATA" } else { "PLAIN_TEXT" }.into(),
                content: (!has_media).then(|| format!("seed message {i}")),
                media_url: has_media.then(|| format!("seed-{i}.bin")),
                media_mime_type: has_media.then(|| "application/octet-stream".to_string()),
                media_size: None,
                media_status: has_media.then(|| "DONE".to_string()),
                status: "READ".into(),
                created_at: (now + Duration::milliseconds(i as i64)).to_rfc3339(),
                quote_message_id: None,
                caption: None,
            };
            self.upsert(&message)?;
            if has_media {
                with_media.push(message);
            }
        }

        info!("Seeded {} messages into conversation {}", count, conversation_id);
        Ok(with_media)
    }
}
