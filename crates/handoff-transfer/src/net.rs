//! Socket plumbing shared by both roles: tuning, a reader task that turns
//! the byte stream into frame bodies, and a writer task draining an mpsc.

use std::io;
use std::net::{IpAddr, UdpSocket};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::{read_frame, write_frame};

/// 4 MB socket buffers for throughput.
const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Frames read ahead of the state machine.
const INBOUND_CAPACITY: usize = 64;

pub(crate) fn tune(stream: &TcpStream) -> io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE)?;
    sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE)?;
    Ok(())
}

/// Spawn a task forwarding frame bodies. The channel closes after a clean
/// EOF; a read error is delivered as the last item.
pub(crate) fn spawn_reader(
    mut reader: OwnedReadHalf,
) -> (mpsc::Receiver<io::Result<Vec<u8>>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let handle = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(body)) => {
                    if tx.send(Ok(body)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Peer closed the stream");
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    (rx, handle)
}

/// Spawn a task writing every queued frame, calling `on_written` with each
/// body length once it is on the socket. Shuts the write side down after
/// the last sender is dropped.
pub(crate) fn spawn_writer<F>(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    on_written: F,
) -> JoinHandle<io::Result<()>>
where
    F: Fn(usize) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            write_frame(&mut writer, &frame).await?;
            on_written(frame.len());
        }
        writer.shutdown().await
    })
}

/// Address of the interface holding the default route. No packet is sent;
/// connecting a UDP socket only selects a source address.
pub(crate) fn primary_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Resolve once `flag` becomes true. Pends forever if the sender is gone.
pub(crate) async fn raised(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}
