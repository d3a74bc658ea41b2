use serde::{Deserialize, Serialize};

// Entity payloads as they travel inside `TransferItem`s. Field names follow
// the persisted columns; optional columns tolerate being absent so that
// older/newer peers can still exchange records.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub owner_id: Option<String>,
    pub category: Option<String>,
    pub name: Option<String>,
    pub icon_url: Option<String>,
    pub announcement: Option<String>,
    pub code_url: Option<String>,
    pub created_at: String,
    pub status: i32,
    pub mute_until: Option<String>,
    pub expire_in: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub full_name: Option<String>,
    pub identity_number: String,
    pub avatar_url: Option<String>,
    pub relationship: String,
    pub biography: Option<String>,
    pub is_verified: Option<bool>,
    pub app_id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub app_id: String,
    pub app_number: String,
    pub name: String,
    pub icon_url: String,
    pub home_uri: String,
    pub redirect_uri: String,
    pub description: String,
    pub creator_id: String,
    pub category: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub icon_url: String,
    pub balance: String,
    pub chain_id: String,
    pub price_usd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub asset_id: String,
    pub amount: String,
    pub opponent_id: Option<String>,
    pub transaction_hash: Option<String>,
    pub memo: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sticker {
    pub sticker_id: String,
    pub album_id: Option<String>,
    pub name: String,
    pub asset_url: String,
    pub asset_type: String,
    pub asset_width: i32,
    pub asset_height: i32,
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub transcript_id: String,
    pub message_id: String,
    pub user_id: Option<String>,
    pub user_full_name: Option<String>,
    pub category: String,
    pub created_at: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_name: Option<String>,
    pub media_size: Option<i64>,
    pub media_mime_type: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub category: String,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime_type: Option<String>,
    pub media_size: Option<i64>,
    pub media_status: Option<String>,
    pub status: String,
    pub created_at: String,
    pub quote_message_id: Option<String>,
    pub caption: Option<String>,
}

impl Message {
    /// Whether this message references an attachment file.
    pub fn has_media(&self) -> bool {
        self.media_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMention {
    pub message_id: String,
    pub conversation_id: String,
    /// JSON-encoded mention map, stored verbatim.
    pub mentions: String,
    pub has_read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiredMessage {
    pub message_id: String,
    pub expire_in: i64,
    pub expire_at: Option<i64>,
}
