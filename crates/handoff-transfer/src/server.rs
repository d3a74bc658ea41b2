//! Sending side: listens for one receiver, authenticates it, and streams
//! the local data set.
//!
//! All state transitions happen on one spawned task. The enumerate-and-send
//! loop runs on a separate `handoff-loader` thread so slow storage never
//! delays handling of the receiver's progress/finish commands.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use bytes::Bytes;
use handoff_crypto::SessionKey;
use handoff_types::{Action, Command, PROTOCOL_VERSION, PairingPayload, RecordSource};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::TransferError;
use crate::flow::{Admission, FlowConditioner};
use crate::net;
use crate::protocol::{self, Frame};
use crate::source::DataSource;
use crate::speed::SpeedInspector;

/// Frames queued between the loader thread and the socket writer. The flow
/// conditioner is what actually bounds memory.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    Idle,
    Listening { hostname: String, port: u16 },
    /// `progress` is the receiver's last reported percentage.
    Transfer { progress: f64, speed: String },
    Closed(ClosedReason),
}

impl ServerState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClosedReason {
    Finished,
    Cancelled,
    Exception(TransferError),
}

/// Why the last inbound connection was turned away. Not fatal; the server
/// keeps listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    MismatchedUser,
    MismatchedCode,
}

#[derive(Clone)]
pub struct TransferServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    source: Arc<dyn RecordSource>,
    code: u16,
    key: SessionKey,
    started: AtomicBool,
    endpoint: Mutex<Option<(String, u16)>>,
    state: watch::Sender<ServerState>,
    blocked: watch::Sender<Option<BlockedReason>>,
    stop: watch::Sender<bool>,
}

/// An authenticated connection, ready to stream.
struct Connection {
    frames: mpsc::Receiver<io::Result<Vec<u8>>>,
    reader: JoinHandle<()>,
    writer: OwnedWriteHalf,
}

enum Handshake {
    Accepted(Connection),
    Rejected,
    Closed,
}

impl TransferServer {
    /// New server with a random session code and a fresh key pair.
    pub fn new(config: ServerConfig, source: Arc<dyn RecordSource>) -> Self {
        let code = rand::rng().random_range(0..=999);
        Self::with_credentials(config, source, code, SessionKey::generate())
    }

    pub fn with_credentials(
        config: ServerConfig,
        source: Arc<dyn RecordSource>,
        code: u16,
        key: SessionKey,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        let (blocked, _) = watch::channel(None);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                config,
                source,
                code,
                key,
                started: AtomicBool::new(false),
                endpoint: Mutex::new(None),
                state,
                blocked,
                stop,
            }),
        }
    }

    pub fn code(&self) -> u16 {
        self.inner.code
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    /// What the receiver needs to connect. `None` until listening.
    pub fn pairing_payload(&self) -> Option<PairingPayload> {
        let endpoint = self.inner.endpoint.lock();
        let (hostname, port) = endpoint.as_ref()?;
        Some(PairingPayload {
            hostname: hostname.clone(),
            port: *port,
            code: self.inner.code,
            key: self.inner.key.clone(),
            account_id: self.inner.config.account_id.clone(),
        })
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_blocked_reason(&self) -> watch::Receiver<Option<BlockedReason>> {
        self.inner.blocked.subscribe()
    }

    pub fn last_connection_blocked_reason(&self) -> Option<BlockedReason> {
        *self.inner.blocked.borrow()
    }

    /// Acknowledge the last blocked reason so the next one is distinguishable.
    pub fn consume_last_connection_blocked_reason(&self) {
        self.inner.blocked.send_replace(None);
    }

    /// Bind an ephemeral port and start accepting. A bind failure is
    /// returned and leaves the server idle; calling again once started is a
    /// no-op.
    pub async fn start_listening(&self) -> io::Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Server already started");
            return Ok(());
        }

        let bound = async {
            let listener = TcpListener::bind((self.inner.config.bind_host, 0)).await?;
            let local = listener.local_addr()?;
            io::Result::Ok((listener, local))
        }
        .await;
        let (listener, local) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!("Unable to listen: {}", e);
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let hostname = self.inner.advertised_host(local.ip());
        *self.inner.endpoint.lock() = Some((hostname.clone(), local.port()));
        info!("Listening on [{}]:{}", hostname, local.port());

        let listening = ServerState::Listening {
            hostname,
            port: local.port(),
        };
        if !self.inner.transition(listening) {
            // Stopped while binding.
            return Ok(());
        }

        let inner = self.inner.clone();
        tokio::spawn(inner.run(listener));
        Ok(())
    }

    /// Close the listener or the active transfer. No-op once closed.
    pub fn stop_listening(&self) {
        if self.state().is_closed() {
            return;
        }
        self.inner.stop.send_replace(true);
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.close(ClosedReason::Cancelled);
        }
    }
}

impl ServerInner {
    /// Apply `next` unless already closed.
    fn transition(&self, next: ServerState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed() {
                return false;
            }
            *state = next;
            true
        })
    }

    fn close(&self, reason: ClosedReason) {
        match &reason {
            ClosedReason::Finished => info!("Transfer finished"),
            ClosedReason::Cancelled => info!("Server stopped"),
            ClosedReason::Exception(e) => error!("Server closed: {}", e),
        }
        self.transition(ServerState::Closed(reason));
    }

    fn advertised_host(&self, bound: IpAddr) -> String {
        if let Some(host) = &self.config.advertise_host {
            return host.clone();
        }
        if !bound.is_unspecified() {
            return bound.to_string();
        }
        net::primary_ipv4()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .to_string()
    }

    fn check_version(&self, command: &Command) {
        if command.version != PROTOCOL_VERSION {
            warn!(
                "Receiver speaks protocol {}, expected {}",
                command.version, PROTOCOL_VERSION
            );
        }
    }

    // ── Listening ──

    async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = net::raised(&mut stop) => {
                    self.close(ClosedReason::Cancelled);
                    return;
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.close(ClosedReason::Exception(TransferError::ConnectionFailed(
                        e.to_string(),
                    )));
                    return;
                }
            };
            info!("New connection from {}", peer);

            match self.handshake(&listener, stream, &mut stop).await {
                Handshake::Accepted(conn) => {
                    drop(listener);
                    self.transfer(conn, &mut stop).await;
                    return;
                }
                Handshake::Rejected => continue,
                Handshake::Closed => return,
            }
        }
    }

    /// Wait for the receiver's `connect`. Other inbound connections arriving
    /// meanwhile are dropped. A peer silent past the handshake timeout is
    /// turned away and listening resumes.
    async fn handshake(
        &self,
        listener: &TcpListener,
        stream: TcpStream,
        stop: &mut watch::Receiver<bool>,
    ) -> Handshake {
        if let Err(e) = net::tune(&stream) {
            warn!("Unable to tune socket: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (mut frames, reader) = net::spawn_reader(read_half);
        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);

        let verdict = loop {
            tokio::select! {
                _ = net::raised(stop) => {
                    reader.abort();
                    self.close(ClosedReason::Cancelled);
                    return Handshake::Closed;
                }
                () = &mut deadline => {
                    warn!("No connect within {:?}, dropping connection", self.config.handshake_timeout);
                    break None;
                }
                extra = listener.accept() => {
                    if let Ok((_, addr)) = extra {
                        warn!("Connection from {} cancelled, another one is in progress", addr);
                    }
                }
                frame = frames.recv() => match frame {
                    None => {
                        warn!("Connection closed before connect");
                        break None;
                    }
                    Some(Err(e)) => {
                        warn!("Handshake read failed: {}", e);
                        break None;
                    }
                    Some(Ok(body)) => match protocol::decode_frame(&body, &self.key) {
                        Ok(Frame::Command(command)) => {
                            self.check_version(&command);
                            match command.action {
                                Action::Connect { code, user_id } => {
                                    break Some(self.authorize(code, &user_id));
                                }
                                _ => warn!("Invalid command before connect: {}", command.name()),
                            }
                        }
                        Ok(_) => warn!("Received data before connect"),
                        Err(e) => {
                            reader.abort();
                            self.close(ClosedReason::Exception(e.into()));
                            return Handshake::Closed;
                        }
                    },
                },
            }
        };

        match verdict {
            Some(Ok(())) => Handshake::Accepted(Connection {
                frames,
                reader,
                writer: write_half,
            }),
            Some(Err(reason)) => {
                reader.abort();
                warn!("Connection rejected: {:?}", reason);
                self.blocked.send_replace(Some(reason));
                Handshake::Rejected
            }
            None => {
                reader.abort();
                Handshake::Rejected
            }
        }
    }

    fn authorize(&self, code: u16, user_id: &str) -> Result<(), BlockedReason> {
        if user_id != self.config.account_id {
            Err(BlockedReason::MismatchedUser)
        } else if code != self.code {
            Err(BlockedReason::MismatchedCode)
        } else {
            Ok(())
        }
    }

    // ── Transfer ──

    async fn transfer(&self, conn: Connection, stop: &mut watch::Receiver<bool>) {
        let Connection {
            mut frames,
            reader,
            writer,
        } = conn;
        self.transition(ServerState::Transfer {
            progress: 0.0,
            speed: String::new(),
        });

        let flow = Arc::new(FlowConditioner::new(
            self.config.max_in_flight,
            self.config.flow_timeout,
        ));
        let speed = Arc::new(SpeedInspector::new());
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let mut writer = {
            let flow = flow.clone();
            let speed = speed.clone();
            net::spawn_writer(writer, out_rx, move |n| {
                flow.signal(n);
                speed.add(n);
            })
        };

        let (done_tx, mut done_rx) = oneshot::channel();
        let source = DataSource::new(
            self.source.clone(),
            self.key.clone(),
            self.config.attachments_dir.clone(),
            self.config.slice_size,
        );
        let key = self.key.clone();
        let pump_flow = flow.clone();
        let spawned = thread::Builder::new()
            .name("handoff-loader".into())
            .spawn(move || {
                let _ = done_tx.send(pump(&source, &key, &pump_flow, &out_tx));
            });
        if let Err(e) = spawned {
            reader.abort();
            writer.abort();
            self.close(ClosedReason::Exception(TransferError::Failed(format!(
                "unable to start loader: {e}"
            ))));
            return;
        }

        let period = self.config.stats_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pump_done = false;
        let mut writer_done = false;

        let reason = loop {
            tokio::select! {
                _ = net::raised(stop) => break ClosedReason::Cancelled,
                frame = frames.recv() => match frame {
                    Some(Ok(body)) => {
                        if let Some(reason) = self.handle_frame(&body) {
                            break reason;
                        }
                    }
                    Some(Err(e)) => {
                        break ClosedReason::Exception(TransferError::ConnectionFailed(e.to_string()));
                    }
                    None => {
                        break ClosedReason::Exception(TransferError::ConnectionFailed(
                            "connection closed by receiver".into(),
                        ));
                    }
                },
                result = &mut done_rx, if !pump_done => {
                    pump_done = true;
                    match result {
                        Ok(Ok(())) => debug!("Loader done"),
                        Ok(Err(e)) => break ClosedReason::Exception(e),
                        Err(_) => {
                            break ClosedReason::Exception(TransferError::Failed(
                                "loader stopped unexpectedly".into(),
                            ));
                        }
                    }
                }
                result = &mut writer, if !writer_done => {
                    writer_done = true;
                    match result {
                        Ok(Ok(())) => debug!("Writer drained"),
                        Ok(Err(e)) => {
                            break ClosedReason::Exception(TransferError::ConnectionFailed(e.to_string()));
                        }
                        Err(e) => break ClosedReason::Exception(TransferError::Failed(e.to_string())),
                    }
                }
                _ = ticker.tick() => {
                    let rate = speed.drain(period);
                    self.state.send_if_modified(|state| match state {
                        ServerState::Transfer { speed, .. } => {
                            *speed = rate;
                            true
                        }
                        _ => false,
                    });
                }
            }
        };

        flow.close();
        reader.abort();
        if !writer_done {
            writer.abort();
        }
        self.close(reason);
    }

    /// Returns a reason when the frame ends the session.
    fn handle_frame(&self, body: &[u8]) -> Option<ClosedReason> {
        match protocol::decode_frame(body, &self.key) {
            Ok(Frame::Command(command)) => {
                self.check_version(&command);
                match command.action {
                    Action::Progress { progress } => {
                        self.state.send_if_modified(|state| match state {
                            ServerState::Transfer { progress: current, .. } => {
                                *current = progress;
                                true
                            }
                            _ => false,
                        });
                        None
                    }
                    Action::Finish => Some(ClosedReason::Finished),
                    _ => {
                        warn!("Invalid command: {}", command.name());
                        None
                    }
                }
            }
            Ok(_) => {
                warn!("Received data from receiver");
                None
            }
            Err(e) => Some(ClosedReason::Exception(e.into())),
        }
    }
}

/// Loader thread body: `start(count)`, every item, then `finish`.
fn pump(
    source: &DataSource,
    key: &SessionKey,
    flow: &FlowConditioner,
    out: &mpsc::Sender<Bytes>,
) -> Result<(), TransferError> {
    let mut send = |frame: Vec<u8>| -> ControlFlow<()> {
        match flow.wait(frame.len()) {
            Admission::Closed => return ControlFlow::Break(()),
            Admission::TimedOut => warn!("Receiver is slow, sending past the in-flight ceiling"),
            Admission::Proceed => {}
        }
        if out.blocking_send(Bytes::from(frame)).is_err() {
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    };

    let total = source.total_count()?;
    info!("Sending {} items", total);
    if send(protocol::encode_command(&Command::start(total), key)?).is_break() {
        return Ok(());
    }
    if source.enumerate(&mut send)?.is_break() {
        debug!("Loader stopped early");
        return Ok(());
    }
    let _ = send(protocol::encode_command(&Command::finish(), key)?);
    info!("All items queued");
    Ok(())
}
