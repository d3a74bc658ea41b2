use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use handoff_crypto::SessionKey;
use handoff_types::PairingPayload;

/// Ceiling on bytes queued for the socket but not yet written.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100 * 1024 * 1024;
/// Longest the sender blocks on the ceiling before pushing on anyway.
pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(10);
/// Plaintext bytes per file slice.
pub const DEFAULT_SLICE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);
/// How long an accepted connection may stay silent before its `connect`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Account the receiving device must present.
    pub account_id: String,
    pub bind_host: IpAddr,
    /// Hostname put in the pairing payload; detected when unset.
    pub advertise_host: Option<String>,
    pub max_in_flight: usize,
    pub flow_timeout: Duration,
    pub slice_size: usize,
    /// Where message attachments live, named by message id.
    pub attachments_dir: Option<PathBuf>,
    pub stats_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_host: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            flow_timeout: DEFAULT_FLOW_TIMEOUT,
            slice_size: DEFAULT_SLICE_SIZE,
            attachments_dir: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hostname: String,
    pub port: u16,
    pub code: u16,
    pub key: SessionKey,
    pub account_id: String,
    /// Scratch directory owned by one session; wiped at start and on every
    /// terminal transition.
    pub cache_dir: PathBuf,
    /// Final home for received attachments. Without one, files are dropped
    /// together with the cache.
    pub attachments_dir: Option<PathBuf>,
    pub stats_interval: Duration,
}

impl ClientConfig {
    /// Connection parameters from a scanned pairing payload. `account_id` is
    /// the local account, which the sender checks against its own.
    pub fn from_pairing(
        payload: PairingPayload,
        account_id: String,
        cache_dir: PathBuf,
        attachments_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            hostname: payload.hostname,
            port: payload.port,
            code: payload.code,
            key: payload.key,
            account_id,
            cache_dir,
            attachments_dir,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}
