use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::*;

/// Entity kinds that can be migrated, in the order the sender enumerates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Conversation,
    Participant,
    User,
    App,
    Asset,
    Snapshot,
    Sticker,
    PinMessage,
    TranscriptMessage,
    Message,
    MessageMention,
    ExpiredMessage,
}

impl ItemKind {
    pub const ALL: [ItemKind; 12] = [
        ItemKind::Conversation,
        ItemKind::Participant,
        ItemKind::User,
        ItemKind::App,
        ItemKind::Asset,
        ItemKind::Snapshot,
        ItemKind::Sticker,
        ItemKind::PinMessage,
        ItemKind::TranscriptMessage,
        ItemKind::Message,
        ItemKind::MessageMention,
        ItemKind::ExpiredMessage,
    ];

    /// Wire discriminator, matching the `type` field of an encoded item.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Participant => "participant",
            Self::User => "user",
            Self::App => "app",
            Self::Asset => "asset",
            Self::Snapshot => "snapshot",
            Self::Sticker => "sticker",
            Self::PinMessage => "pin_message",
            Self::TranscriptMessage => "transcript_message",
            Self::Message => "message",
            Self::MessageMention => "message_mention",
            Self::ExpiredMessage => "expired_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

/// A persisted entity that can be keyed and moved as a `TransferItem`.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: ItemKind;

    /// Stable primary key, used for idempotent upserts.
    fn key(&self) -> String;
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr, |$this:ident| $key:expr) => {
        impl Record for $ty {
            const KIND: ItemKind = $kind;

            fn key(&self) -> String {
                let $this = self;
                $key
            }
        }
    };
}

impl_record!(Conversation, ItemKind::Conversation, |c| c.conversation_id.clone());
impl_record!(Participant, ItemKind::Participant, |p| format!("{}:{}", p.conversation_id, p.user_id));
impl_record!(User, ItemKind::User, |u| u.user_id.clone());
impl_record!(App, ItemKind::App, |a| a.app_id.clone());
impl_record!(Asset, ItemKind::Asset, |a| a.asset_id.clone());
impl_record!(Snapshot, ItemKind::Snapshot, |s| s.snapshot_id.clone());
impl_record!(Sticker, ItemKind::Sticker, |s| s.sticker_id.clone());
impl_record!(PinMessage, ItemKind::PinMessage, |p| p.message_id.clone());
impl_record!(TranscriptMessage, ItemKind::TranscriptMessage, |t| format!("{}:{}", t.transcript_id, t.message_id));
impl_record!(Message, ItemKind::Message, |m| m.message_id.clone());
impl_record!(MessageMention, ItemKind::MessageMention, |m| m.message_id.clone());
impl_record!(ExpiredMessage, ItemKind::ExpiredMessage, |e| e.message_id.clone());

/// One logical record carried by a message frame.
///
/// Encoded as `{"type": "<kind>", "data": {...}}`. Kinds this build does not
/// know decode to `Unknown` so newer senders stay compatible.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransferItem {
    Conversation(Conversation),
    Participant(Participant),
    User(User),
    App(App),
    Asset(Asset),
    Snapshot(Snapshot),
    Sticker(Sticker),
    PinMessage(PinMessage),
    TranscriptMessage(TranscriptMessage),
    Message(Message),
    MessageMention(MessageMention),
    ExpiredMessage(ExpiredMessage),
    #[serde(skip)]
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TransferItem {
    pub fn kind(&self) -> Option<ItemKind> {
        Some(match self {
            Self::Conversation(_) => ItemKind::Conversation,
            Self::Participant(_) => ItemKind::Participant,
            Self::User(_) => ItemKind::User,
            Self::App(_) => ItemKind::App,
            Self::Asset(_) => ItemKind::Asset,
            Self::Snapshot(_) => ItemKind::Snapshot,
            Self::Sticker(_) => ItemKind::Sticker,
            Self::PinMessage(_) => ItemKind::PinMessage,
            Self::TranscriptMessage(_) => ItemKind::TranscriptMessage,
            Self::Message(_) => ItemKind::Message,
            Self::MessageMention(_) => ItemKind::MessageMention,
            Self::ExpiredMessage(_) => ItemKind::ExpiredMessage,
            Self::Unknown(_) => return None,
        })
    }

    /// Serialize to the JSON wire form. `Unknown` items cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the JSON wire form.
    ///
    /// Errors only for malformed JSON or a known kind whose payload does not
    /// match its entity shape.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let Some(kind) = ItemKind::parse(&envelope.kind) else {
            return Ok(Self::Unknown(envelope.kind));
        };
        let data = envelope.data;
        Ok(match kind {
            ItemKind::Conversation => Self::Conversation(serde_json::from_value(data)?),
            ItemKind::Participant => Self::Participant(serde_json::from_value(data)?),
            ItemKind::User => Self::User(serde_json::from_value(data)?),
            ItemKind::App => Self::App(serde_json::from_value(data)?),
            ItemKind::Asset => Self::Asset(serde_json::from_value(data)?),
            ItemKind::Snapshot => Self::Snapshot(serde_json::from_value(data)?),
            ItemKind::Sticker => Self::Sticker(serde_json::from_value(data)?),
            ItemKind::PinMessage => Self::PinMessage(serde_json::from_value(data)?),
            ItemKind::TranscriptMessage => Self::TranscriptMessage(serde_json::from_value(data)?),
            ItemKind::Message => Self::Message(serde_json::from_value(data)?),
            ItemKind::MessageMention => Self::MessageMention(serde_json::from_value(data)?),
            ItemKind::ExpiredMessage => Self::ExpiredMessage(serde_json::from_value(data)?),
        })
    }

    /// Build an item of `kind` from a stored JSON entity body.
    pub fn from_stored(kind: ItemKind, body: &str) -> Result<Self, serde_json::Error> {
        let data: serde_json::Value = serde_json::from_str(body)?;
        let envelope = serde_json::json!({ "type": kind.as_str(), "data": data });
        Self::decode(&serde_json::to_vec(&envelope)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_message(id: &str) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: "c1".into(),
            user_id: "U1".into(),
            category: "PLAIN_TEXT".into(),
            content: Some("hello".into()),
            media_url: None,
            media_mime_type: None,
            media_size: None,
            media_status: None,
            status: "READ".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            quote_message_id: None,
            caption: None,
        }
    }

    fn one_of_each() -> Vec<TransferItem> {
        vec![
            TransferItem::Conversation(Conversation {
                conversation_id: "c1".into(),
                owner_id: Some("U1".into()),
                category: Some("GROUP".into()),
                name: Some("Friends".into()),
                icon_url: None,
                announcement: Some("welcome".into()),
                code_url: None,
                created_at: "2024-01-01T00:00:00Z".into(),
                status: 2,
                mute_until: None,
                expire_in: Some(3600),
            }),
            TransferItem::Participant(Participant {
                conversation_id: "c1".into(),
                user_id: "U2".into(),
                role: "ADMIN".into(),
                created_at: "2024-01-01T00:00:00Z".into(),
            }),
            TransferItem::User(User {
                user_id: "U2".into(),
                full_name: Some("Alice".into()),
                identity_number: "7000".into(),
                avatar_url: None,
                relationship: "FRIEND".into(),
                biography: None,
                is_verified: Some(false),
                app_id: None,
                created_at: None,
            }),
            TransferItem::App(App {
                app_id: "a1".into(),
                app_number: "7000101".into(),
                name: "Bot".into(),
                icon_url: "https://example.com/i.png".into(),
                home_uri: "https://example.com".into(),
                redirect_uri: "https://example.com/cb".into(),
                description: "".into(),
                creator_id: "U2".into(),
                category: None,
                updated_at: None,
            }),
            TransferItem::Asset(Asset {
                asset_id: "btc".into(),
                symbol: "BTC".into(),
                name: "Bitcoin".into(),
                icon_url: "".into(),
                balance: "0.1".into(),
                chain_id: "btc".into(),
                price_usd: "60000".into(),
            }),
            TransferItem::Snapshot(Snapshot {
                snapshot_id: "s1".into(),
                kind: "transfer".into(),
                asset_id: "btc".into(),
                amount: "-0.01".into(),
                opponent_id: Some("U2".into()),
                transaction_hash: None,
                memo: Some("lunch".into()),
                created_at: "2024-01-01T00:00:00Z".into(),
            }),
            TransferItem::Sticker(Sticker {
                sticker_id: "st1".into(),
                album_id: None,
                name: "wave".into(),
                asset_url: "https://example.com/w.webp".into(),
                asset_type: "WEBP".into(),
                asset_width: 128,
                asset_height: 128,
                last_used_at: None,
            }),
            TransferItem::PinMessage(PinMessage {
                message_id: "m1".into(),
                conversation_id: "c1".into(),
                created_at: "2024-01-01T00:00:00Z".into(),
            }),
            TransferItem::TranscriptMessage(TranscriptMessage {
                transcript_id: "t1".into(),
                message_id: "m9".into(),
                user_id: None,
                user_full_name: Some("Alice".into()),
                category: "PLAIN_TEXT".into(),
                created_at: "2024-01-01T00:00:00Z".into(),
                content: Some("quoted".into()),
                media_url: None,
                media_name: None,
                media_size: None,
                media_mime_type: None,
                caption: None,
            }),
            TransferItem::Message(sample_message("m1")),
            TransferItem::MessageMention(MessageMention {
                message_id: "m1".into(),
                conversation_id: "c1".into(),
                mentions: r#"{"7000":"Alice"}"#.into(),
                has_read: true,
            }),
            TransferItem::ExpiredMessage(ExpiredMessage {
                message_id: "m1".into(),
                expire_in: 60,
                expire_at: Some(1_700_000_000),
            }),
        ]
    }

    #[test]
    fn every_kind_roundtrips() {
        let items = one_of_each();
        assert_eq!(items.len(), ItemKind::ALL.len());
        for (item, kind) in items.iter().zip(ItemKind::ALL) {
            assert_eq!(item.kind(), Some(kind));
            let bytes = item.encode().unwrap();
            assert_eq!(&TransferItem::decode(&bytes).unwrap(), item);
        }
    }

    #[test]
    fn wire_shape_is_type_and_data() {
        let bytes = TransferItem::Message(sample_message("m1")).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["message_id"], "m1");
    }

    #[test]
    fn unknown_kind_is_kept_not_rejected() {
        let bytes = br#"{"type":"safe_snapshot","data":{"id":"x"}}"#;
        let item = TransferItem::decode(bytes).unwrap();
        assert_eq!(item, TransferItem::Unknown("safe_snapshot".into()));
        assert_eq!(item.kind(), None);
        assert!(item.encode().is_err());
    }

    #[test]
    fn malformed_known_kind_is_an_error() {
        let bytes = br#"{"type":"message","data":{"message_id":42}}"#;
        assert!(TransferItem::decode(bytes).is_err());
        assert!(TransferItem::decode(b"not json").is_err());
    }

    #[test]
    fn extra_fields_are_ignored() {
        let bytes = br#"{"type":"pin_message","data":{"message_id":"m","conversation_id":"c","created_at":"t","extra":1}}"#;
        assert!(matches!(
            TransferItem::decode(bytes).unwrap(),
            TransferItem::PinMessage(_)
        ));
    }

    #[test]
    fn from_stored_body() {
        let body = serde_json::to_string(&sample_message("m2")).unwrap();
        let item = TransferItem::from_stored(ItemKind::Message, &body).unwrap();
        assert_eq!(item, TransferItem::Message(sample_message("m2")));
    }

    #[test]
    fn kind_strings_roundtrip() {
        for kind in ItemKind::ALL {
            assert_eq!(ItemKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemKind::parse("unknown"), None);
    }

    #[test]
    fn record_keys() {
        let p = Participant {
            conversation_id: "c".into(),
            user_id: "u".into(),
            role: "".into(),
            created_at: "".into(),
        };
        assert_eq!(p.key(), "c:u");
        assert_eq!(<Participant as Record>::KIND, ItemKind::Participant);
    }
}
