/// Handoff wire protocol: frame layout, sealing and framing.
///
/// Every frame travels as `[len u32 BE][body]` on the TCP stream. The body is:
///
///   [0]        Frame type (0x01 command, 0x02 message, 0x03 file)
///   [1..]      Type header (file only: 16-byte file id + u64 BE remaining)
///   [..]       Sealed payload (AES-256-GCM: 12-byte nonce + ciphertext + 16-byte tag)
///   [len-32..] HMAC-SHA256 over everything before it
///
/// The trailing tag is verified before anything else in the body is looked
/// at, type byte included.

use std::fmt;
use std::io;

use handoff_crypto::{GCM_TAG_SIZE, MAC_SIZE, NONCE_SIZE, SessionKey};
use handoff_types::Command;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Maximum frame body size (16 MB, well above a 1 MB slice plus overhead).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const FILE_HEADER_SIZE: usize = 16 + 8;
const SEAL_OVERHEAD: usize = NONCE_SIZE + GCM_TAG_SIZE;
const MIN_FRAME_SIZE: usize = 1 + SEAL_OVERHEAD + MAC_SIZE;
/// Largest plaintext slice whose file frame still fits in `MAX_FRAME_SIZE`.
pub const MAX_SLICE_SIZE: usize = MAX_FRAME_SIZE - (1 + FILE_HEADER_SIZE + SEAL_OVERHEAD + MAC_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Command = 0x01,
    Message = 0x02,
    File = 0x03,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Message),
            0x03 => Some(Self::File),
            _ => None,
        }
    }

    fn header_size(self) -> usize {
        match self {
            Self::File => FILE_HEADER_SIZE,
            Self::Command | Self::Message => 0,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Command => "command",
            Self::Message => "message",
            Self::File => "file",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("HMAC mismatch (local {local}, remote {remote})")]
    Integrity { local: String, remote: String },
    #[error("{kind} frame decode failed: {reason}")]
    Decode { kind: FrameType, reason: String },
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
}

/// One slice of a file, tag verified but payload still sealed. The file
/// stream decrypts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub id: Uuid,
    /// Plaintext bytes of the file still to come after this slice.
    pub remaining: u64,
    pub sealed: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Command(Command),
    /// Decrypted transfer item JSON.
    Message(Vec<u8>),
    File(FileSlice),
}

// ── Encoding ──

pub fn encode_command(command: &Command, key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(command).map_err(|e| CodecError::Encode(e.to_string()))?;
    seal_frame(FrameType::Command, &[], &json, key)
}

pub fn encode_message(payload: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    seal_frame(FrameType::Message, &[], payload, key)
}

pub fn encode_file_slice(
    id: Uuid,
    remaining: u64,
    plaintext: &[u8],
    key: &SessionKey,
) -> Result<Vec<u8>, CodecError> {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[..16].copy_from_slice(id.as_bytes());
    header[16..].copy_from_slice(&remaining.to_be_bytes());
    seal_frame(FrameType::File, &header, plaintext, key)
}

fn seal_frame(
    kind: FrameType,
    header: &[u8],
    plaintext: &[u8],
    key: &SessionKey,
) -> Result<Vec<u8>, CodecError> {
    let size = 1 + header.len() + plaintext.len() + SEAL_OVERHEAD + MAC_SIZE;
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::Encode(format!(
            "{kind} frame of {size} bytes exceeds {MAX_FRAME_SIZE}"
        )));
    }
    let sealed =
        handoff_crypto::seal(key.aes(), plaintext).map_err(|e| CodecError::Encode(e.to_string()))?;
    let type_byte = [kind as u8];
    let tag = handoff_crypto::mac(key.hmac(), &[&type_byte, header, &sealed]);

    let mut body = Vec::with_capacity(1 + header.len() + sealed.len() + MAC_SIZE);
    body.push(kind as u8);
    body.extend_from_slice(header);
    body.extend_from_slice(&sealed);
    body.extend_from_slice(&tag);
    Ok(body)
}

// ── Decoding ──

/// Verify the tag, then split the body into type, header and sealed payload.
fn verify<'a>(
    body: &'a [u8],
    key: &SessionKey,
) -> Result<(FrameType, &'a [u8], &'a [u8]), CodecError> {
    if body.len() < MIN_FRAME_SIZE {
        return Err(CodecError::Truncated(body.len()));
    }
    let (signed, remote) = body.split_at(body.len() - MAC_SIZE);
    let local = handoff_crypto::mac(key.hmac(), &[signed]);
    if !handoff_crypto::verify(&local, remote) {
        return Err(CodecError::Integrity {
            local: hex::encode(local),
            remote: hex::encode(remote),
        });
    }

    let kind = FrameType::from_byte(signed[0]).ok_or(CodecError::UnknownFrameType(signed[0]))?;
    let rest = &signed[1..];
    let header_size = kind.header_size();
    if rest.len() < header_size + SEAL_OVERHEAD {
        return Err(CodecError::Truncated(body.len()));
    }
    let (header, sealed) = rest.split_at(header_size);
    Ok((kind, header, sealed))
}

fn open(kind: FrameType, sealed: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    handoff_crypto::open(key.aes(), sealed).map_err(|e| CodecError::Decode {
        kind,
        reason: e.to_string(),
    })
}

/// Decode any frame body.
///
/// Commands and messages come back decrypted; file slices keep their sealed
/// payload for the file stream.
pub fn decode_frame(body: &[u8], key: &SessionKey) -> Result<Frame, CodecError> {
    let (kind, header, sealed) = verify(body, key)?;
    match kind {
        FrameType::Command => {
            let json = open(kind, sealed, key)?;
            let command = serde_json::from_slice(&json).map_err(|e| CodecError::Decode {
                kind,
                reason: e.to_string(),
            })?;
            Ok(Frame::Command(command))
        }
        FrameType::Message => Ok(Frame::Message(open(kind, sealed, key)?)),
        FrameType::File => {
            let mut id = [0u8; 16];
            id.copy_from_slice(&header[..16]);
            let mut remaining = [0u8; 8];
            remaining.copy_from_slice(&header[16..]);
            Ok(Frame::File(FileSlice {
                id: Uuid::from_bytes(id),
                remaining: u64::from_be_bytes(remaining),
                sealed: sealed.to_vec(),
            }))
        }
    }
}

pub fn decode_command(body: &[u8], key: &SessionKey) -> Result<Command, CodecError> {
    match decode_frame(body, key)? {
        Frame::Command(command) => Ok(command),
        other => Err(unexpected(FrameType::Command, &other)),
    }
}

pub fn decode_message(body: &[u8], key: &SessionKey) -> Result<Vec<u8>, CodecError> {
    match decode_frame(body, key)? {
        Frame::Message(payload) => Ok(payload),
        other => Err(unexpected(FrameType::Message, &other)),
    }
}

fn unexpected(kind: FrameType, got: &Frame) -> CodecError {
    let got = match got {
        Frame::Command(_) => FrameType::Command,
        Frame::Message(_) => FrameType::Message,
        Frame::File(_) => FrameType::File,
    };
    CodecError::Decode {
        kind,
        reason: format!("got a {got} frame"),
    }
}

// ── Framing ──

/// Read one length-prefixed frame body. `Ok(None)` means the peer closed the
/// stream on a frame boundary; a close inside the prefix is `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let n = reader.read(&mut prefix).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[n..]).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await
}
