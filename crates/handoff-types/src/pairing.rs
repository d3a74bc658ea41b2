use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use handoff_crypto::SessionKey;
use thiserror::Error;
use url::Url;

use crate::command::{Action, Command, PushContext};

pub const URI_SCHEME: &str = "handoff";
pub const URI_HOST: &str = "device-transfer";

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("invalid pairing uri: {0}")]
    InvalidUri(String),
    #[error("pairing uri missing data parameter")]
    MissingData,
    #[error("pairing data is not base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("pairing data is not a push command: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pairing command is not a push")]
    NotPush,
    #[error("invalid session key: {0}")]
    Key(#[from] handoff_crypto::CryptoError),
}

/// Everything a receiver needs to reach and authenticate against a sender.
/// Rendered as a QR code / deep link by the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingPayload {
    pub hostname: String,
    pub port: u16,
    pub code: u16,
    pub key: SessionKey,
    pub account_id: String,
}

impl PairingPayload {
    pub fn to_command(&self) -> Command {
        Command::new(Action::Push(PushContext {
            hostname: self.hostname.clone(),
            port: self.port,
            code: self.code,
            key: self.key.to_base64(),
            user_id: self.account_id.clone(),
        }))
    }

    pub fn from_context(ctx: PushContext) -> Result<Self, PairingError> {
        Ok(Self {
            key: SessionKey::from_base64(&ctx.key)?,
            hostname: ctx.hostname,
            port: ctx.port,
            code: ctx.code,
            account_id: ctx.user_id,
        })
    }

    /// `handoff://device-transfer?data=<base64url(push command JSON)>`
    pub fn to_uri(&self) -> String {
        // Serializing a plain struct of strings and integers cannot fail.
        let json = serde_json::to_vec(&self.to_command()).unwrap_or_default();
        format!(
            "{URI_SCHEME}://{URI_HOST}?data={}",
            URL_SAFE_NO_PAD.encode(json)
        )
    }

    pub fn from_uri(uri: &str) -> Result<Self, PairingError> {
        let url = Url::parse(uri).map_err(|e| PairingError::InvalidUri(e.to_string()))?;
        if url.scheme() != URI_SCHEME || url.host_str() != Some(URI_HOST) {
            return Err(PairingError::InvalidUri(format!(
                "expected {URI_SCHEME}://{URI_HOST}"
            )));
        }
        let data = url
            .query_pairs()
            .find(|(k, _)| k == "data")
            .map(|(_, v)| v.into_owned())
            .ok_or(PairingError::MissingData)?;

        let json = URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))?;
        let command: Command = serde_json::from_slice(&json)?;
        match command.action {
            Action::Push(ctx) => Self::from_context(ctx),
            _ => Err(PairingError::NotPush),
        }
    }
}
