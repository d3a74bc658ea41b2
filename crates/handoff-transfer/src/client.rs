//! Receiving side: connects to a sender, authenticates, reconstructs files
//! and feeds records to the message processor.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use handoff_crypto::SessionKey;
use handoff_types::{Action, Command, PROTOCOL_VERSION, PairingError, PairingPayload, RecordStore};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::TransferError;
use crate::file_stream::{FileStream, FileStreamError};
use crate::net;
use crate::processor::MessageProcessor;
use crate::protocol::{self, CodecError, FileSlice, Frame, FrameType};
use crate::speed::SpeedInspector;

const OUTBOUND_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Idle,
    Connecting,
    /// `progress` is a percentage of the announced total.
    Transfer { progress: f64, speed: String },
    /// `progress` is the processor's drained fraction.
    Importing { progress: f64 },
    Finished,
    Failed(TransferError),
    Cancelled,
}

impl ClientState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_) | Self::Cancelled)
    }
}

#[derive(Clone)]
pub struct TransferClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    store: Arc<dyn RecordStore>,
    started: AtomicBool,
    processed: AtomicU64,
    state: watch::Sender<ClientState>,
    cancel: watch::Sender<bool>,
}

enum Ending {
    Finished,
    Cancelled,
    Failed(TransferError),
}

impl TransferClient {
    pub fn new(config: ClientConfig, store: Arc<dyn RecordStore>) -> Self {
        let (state, _) = watch::channel(ClientState::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                started: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                state,
                cancel,
            }),
        }
    }

    /// Build a client from a scanned `handoff://device-transfer` URI.
    pub fn from_pairing(
        uri: &str,
        account_id: impl Into<String>,
        cache_dir: PathBuf,
        attachments_dir: Option<PathBuf>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, PairingError> {
        let payload = PairingPayload::from_uri(uri)?;
        let config = ClientConfig::from_pairing(payload, account_id.into(), cache_dir, attachments_dir);
        Ok(Self::new(config, store))
    }

    /// Begin the session on the current Tokio runtime. Only the first call
    /// has an effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Client already started");
            return;
        }
        if !self.inner.transition(ClientState::Connecting) {
            return;
        }
        tokio::spawn(self.inner.clone().run());
    }

    /// Tear the session down without marking it failed. No-op once terminal.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.inner.cancel.send_replace(true);
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.transition(ClientState::Cancelled);
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Messages plus completed files received so far.
    pub fn processed_count(&self) -> u64 {
        self.inner.processed.load(Ordering::SeqCst)
    }
}

impl ClientInner {
    fn transition(&self, next: ClientState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = next;
            true
        })
    }

    async fn run(self: Arc<Self>) {
        let mut cancel = self.cancel.subscribe();
        let ending = self.session(&mut cancel).await;

        if let Err(e) = remove_cache(&self.config.cache_dir) {
            warn!("Unable to remove cache container: {}", e);
        }
        let next = match ending {
            Ending::Finished => {
                info!(
                    "Transfer finished, {} units received",
                    self.processed.load(Ordering::SeqCst)
                );
                ClientState::Finished
            }
            Ending::Cancelled => {
                info!("Transfer cancelled");
                ClientState::Cancelled
            }
            Ending::Failed(e) => {
                error!("Transfer failed: {}", e);
                ClientState::Failed(e)
            }
        };
        self.transition(next);
    }

    async fn session(&self, cancel: &mut watch::Receiver<bool>) -> Ending {
        let config = &self.config;
        if let Err(e) = prepare_cache(&config.cache_dir) {
            return Ending::Failed(TransferError::CreateCacheContainer(e.to_string()));
        }

        info!("Connecting to [{}]:{}", config.hostname, config.port);
        let stream = tokio::select! {
            _ = net::raised(cancel) => return Ending::Cancelled,
            connected = TcpStream::connect((config.hostname.as_str(), config.port)) => match connected {
                Ok(stream) => stream,
                Err(e) => return Ending::Failed(TransferError::ConnectionFailed(e.to_string())),
            },
        };
        if let Err(e) = net::tune(&stream) {
            warn!("Unable to tune socket: {}", e);
        }

        let processor = match MessageProcessor::spawn(self.store.clone(), config.attachments_dir.clone()) {
            Ok(processor) => processor,
            Err(e) => {
                return Ending::Failed(TransferError::Failed(format!(
                    "unable to start processor: {e}"
                )));
            }
        };

        let (read_half, write_half) = stream.into_split();
        let (mut frames, reader) = net::spawn_reader(read_half);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let mut writer = net::spawn_writer(write_half, out_rx, |_| {});

        let mut session = Session {
            inner: self,
            processor,
            speed: SpeedInspector::new(),
            out: Some(out_tx),
            stream: None,
            total: None,
            finished: false,
        };
        let ending = session.drive(&mut frames, &mut writer, cancel).await;

        reader.abort();
        if !matches!(ending, Ending::Finished) {
            session.processor.cancel();
            writer.abort();
        }
        ending
    }
}

/// Per-connection state, owned by the client task.
struct Session<'a> {
    inner: &'a ClientInner,
    processor: MessageProcessor,
    speed: SpeedInspector,
    out: Option<mpsc::Sender<Bytes>>,
    stream: Option<FileStream>,
    total: Option<u64>,
    finished: bool,
}

impl Session<'_> {
    async fn drive(
        &mut self,
        frames: &mut mpsc::Receiver<io::Result<Vec<u8>>>,
        writer: &mut JoinHandle<io::Result<()>>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Ending {
        let connect = Command::connect(self.inner.config.code, self.inner.config.account_id.clone());
        if let Err(e) = self.send(&connect).await {
            return Ending::Failed(e);
        }

        let mut progress = self.processor.subscribe_progress();
        let mut errors = self.processor.subscribe_errors();
        let mut ticker: Option<Interval> = None;
        let mut frames_open = true;
        let mut writer_done = false;
        let mut progress_open = true;
        let mut errors_open = true;

        loop {
            tokio::select! {
                _ = net::raised(cancel) => return Ending::Cancelled,
                frame = frames.recv(), if frames_open => match frame {
                    Some(Ok(body)) => {
                        if let Err(e) = self.handle_frame(&body, &mut ticker).await {
                            return Ending::Failed(e);
                        }
                    }
                    Some(Err(e)) if !self.finished => {
                        return Ending::Failed(TransferError::ConnectionFailed(e.to_string()));
                    }
                    None if !self.finished => return Ending::Failed(TransferError::RemoteComplete),
                    _ => {
                        debug!("Connection closed after finish");
                        frames_open = false;
                    }
                },
                _ = next_tick(&mut ticker) => {
                    if let Err(e) = self.report_progress().await {
                        return Ending::Failed(e);
                    }
                }
                changed = progress.changed(), if self.finished && progress_open => {
                    progress_open = changed.is_ok();
                    let fraction = *progress.borrow_and_update();
                    if fraction >= 1.0 {
                        return Ending::Finished;
                    }
                    if progress_open {
                        self.inner.transition(ClientState::Importing { progress: fraction });
                    } else if errors.borrow().is_none() {
                        return Ending::Failed(TransferError::Storage(
                            "processor stopped before draining".into(),
                        ));
                    }
                }
                changed = errors.changed(), if errors_open => {
                    errors_open = changed.is_ok();
                    let failure = errors.borrow_and_update().clone();
                    if let Some(e) = failure {
                        return Ending::Failed(e.into());
                    }
                }
                result = &mut *writer, if !writer_done => {
                    writer_done = true;
                    let failure = match result {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(e) => Some(e.to_string()),
                    };
                    if let Some(reason) = failure {
                        if !self.finished {
                            return Ending::Failed(TransferError::ConnectionFailed(reason));
                        }
                        debug!("Writer failed after finish: {}", reason);
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        body: &[u8],
        ticker: &mut Option<Interval>,
    ) -> Result<(), TransferError> {
        self.speed.add(body.len());
        match protocol::decode_frame(body, &self.inner.config.key) {
            Ok(Frame::Command(command)) => self.handle_command(command, ticker).await,
            Ok(Frame::Message(payload)) => {
                self.inner.processed.fetch_add(1, Ordering::SeqCst);
                self.processor.process(payload);
                Ok(())
            }
            Ok(Frame::File(slice)) => self.receive_file(slice).await,
            // Counted like any other message; one bad item never ends the session.
            Err(CodecError::Decode {
                kind: FrameType::Message,
                reason,
            }) => {
                self.inner.processed.fetch_add(1, Ordering::SeqCst);
                warn!("Dropping undecryptable message: {}", reason);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        ticker: &mut Option<Interval>,
    ) -> Result<(), TransferError> {
        if command.version != PROTOCOL_VERSION {
            warn!(
                "Sender speaks protocol {}, expected {}",
                command.version, PROTOCOL_VERSION
            );
        }
        match command.action {
            Action::Start { total } => {
                info!("Receiving {} items", total);
                self.total = Some(total);
                self.inner.transition(ClientState::Transfer {
                    progress: 0.0,
                    speed: String::new(),
                });
                let period = self.inner.config.stats_interval;
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(interval);
                Ok(())
            }
            Action::Finish => {
                info!("Sender finished, importing");
                if let Some(stream) = self.stream.take() {
                    warn!("File {} incomplete at finish, discarded", stream.id());
                }
                self.finished = true;
                *ticker = None;
                self.send(&Command::finish()).await?;
                // Writer shuts the socket down once the echo is out.
                self.out = None;
                self.processor.finish_processing();
                self.inner
                    .transition(ClientState::Importing { progress: 0.0 });
                Ok(())
            }
            _ => {
                warn!("Invalid command: {}", command.name());
                Ok(())
            }
        }
    }

    async fn receive_file(&mut self, slice: FileSlice) -> Result<(), TransferError> {
        let open = match self.stream.take() {
            Some(open) if open.id() != slice.id => {
                return Err(TransferError::ProtocolViolation(format!(
                    "file {} started while {} is open",
                    slice.id,
                    open.id()
                )));
            }
            open => open,
        };
        if open.is_none() {
            debug!("Receiving file {}", slice.id);
        }

        // File I/O stays off the runtime's worker threads.
        let key = self.inner.config.key.clone();
        let dir = self.inner.config.cache_dir.clone();
        let (stream, completed) = tokio::task::spawn_blocking(move || append(open, slice, key, &dir))
            .await
            .map_err(|e| TransferError::ReceiveFile(e.to_string()))?
            .map_err(|e| TransferError::ReceiveFile(e.to_string()))?;

        let Some(path) = completed else {
            self.stream = Some(stream);
            return Ok(());
        };
        debug!("File {} complete, {} bytes", stream.id(), stream.written());
        self.inner.processed.fetch_add(1, Ordering::SeqCst);
        self.processor.report_file_received(stream.id(), path);
        Ok(())
    }

    async fn report_progress(&mut self) -> Result<(), TransferError> {
        let Some(total) = self.total else {
            return Ok(());
        };
        let processed = self.inner.processed.load(Ordering::SeqCst);
        let progress = if total == 0 {
            100.0
        } else {
            (processed as f64 * 100.0 / total as f64).min(100.0)
        };
        let speed = self.speed.drain(self.inner.config.stats_interval);
        self.inner
            .transition(ClientState::Transfer { progress, speed });
        self.send(&Command::progress(progress)).await
    }

    async fn send(&self, command: &Command) -> Result<(), TransferError> {
        let body = protocol::encode_command(command, &self.inner.config.key)?;
        let out = self
            .out
            .as_ref()
            .ok_or_else(|| TransferError::Failed("connection already closed".into()))?;
        out.send(Bytes::from(body))
            .await
            .map_err(|_| TransferError::ConnectionFailed("writer closed".into()))
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Append one slice, opening the stream on the first and closing it on the
/// last. Returns the stream and, once closed, the finished file's path.
fn append(
    open: Option<FileStream>,
    slice: FileSlice,
    key: SessionKey,
    dir: &Path,
) -> Result<(FileStream, Option<PathBuf>), FileStreamError> {
    let mut stream = match open {
        Some(stream) => stream,
        None => FileStream::create(slice.id, key, dir)?,
    };
    stream.write(&slice.sealed)?;
    if slice.remaining > 0 {
        return Ok((stream, None));
    }
    let path = stream.close()?;
    Ok((stream, Some(path)))
}

fn prepare_cache(dir: &Path) -> io::Result<()> {
    remove_cache(dir)?;
    fs::create_dir_all(dir)
}

fn remove_cache(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
