//! Client connection plumbing
//!
//! Each accepted socket gets one connection task that owns the stream,
//! reads and dispatches frames, and applies write/control commands issued by
//! action runners and operator calls. All writes to a socket funnel through
//! its task, so responses are never interleaved mid-frame.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::protocol::{encode_frame, parse_frame, Frame};
use crate::stub::CloseType;

use super::bound::{BoundNode, Outcome};

/// Commands applied by a connection task on behalf of other tasks
pub(crate) enum WriteCommand {
    /// Write these bytes; ack after they were handed to the transport
    Frame(Bytes, Option<oneshot::Sender<()>>),
    /// Half-close the write side (FIN)
    ShutdownWrite(oneshot::Sender<()>),
    /// Stop reading from the socket for good
    DisableRead(oneshot::Sender<()>),
}

/// Handle to one accepted client connection
pub struct ClientChannel {
    pub id: u64,
    pub remote: SocketAddr,
    writer: mpsc::UnboundedSender<WriteCommand>,
    close_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    keyspace: Mutex<Option<String>>,
}

impl ClientChannel {
    /// Whether the connection task has finished
    pub fn is_closed(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Keyspace selected by the last `USE` on this connection
    pub fn keyspace(&self) -> Option<String> {
        self.keyspace.lock().clone()
    }

    pub(crate) fn set_keyspace(&self, keyspace: String) {
        *self.keyspace.lock() = Some(keyspace);
    }

    /// Queue a frame and wait until it was handed to the transport.
    /// Writing on a closed connection fails silently.
    pub(crate) async fn write_frame(&self, frame: &Frame) {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .writer
            .send(WriteCommand::Frame(buf.freeze(), Some(ack_tx)))
            .is_err()
        {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Close this channel with the given method and wait for completion
    pub async fn close(&self, close_type: CloseType) {
        match close_type {
            CloseType::Disconnect => {
                let _ = self.close_tx.send(true);
                let mut done = self.done_rx.clone();
                while !*done.borrow() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
            }
            CloseType::ShutdownWrite => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if self.writer.send(WriteCommand::ShutdownWrite(ack_tx)).is_ok() {
                    let _ = ack_rx.await;
                }
            }
            CloseType::ShutdownRead => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if self.writer.send(WriteCommand::DisableRead(ack_tx)).is_ok() {
                    let _ = ack_rx.await;
                }
            }
        }
    }
}

/// Spawn the connection task for an accepted socket and return its handle
pub(crate) fn spawn_connection(
    node: Arc<BoundNode>,
    stream: TcpStream,
    remote: SocketAddr,
    id: u64,
) -> Arc<ClientChannel> {
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);

    let channel = Arc::new(ClientChannel {
        id,
        remote,
        writer: writer_tx,
        close_tx,
        done_rx,
        keyspace: Mutex::new(None),
    });

    let task_channel = channel.clone();
    tokio::spawn(async move {
        connection_loop(node.clone(), task_channel, stream, writer_rx, close_rx).await;
        let _ = done_tx.send(true);
        node.forget_channel(id);
    });

    channel
}

async fn connection_loop(
    node: Arc<BoundNode>,
    channel: Arc<ClientChannel>,
    stream: TcpStream,
    mut writer_rx: mpsc::UnboundedReceiver<WriteCommand>,
    mut close_rx: watch::Receiver<bool>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4 * 1024);
    let mut reading = true;

    loop {
        tokio::select! {
            biased;
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    debug!(remote = %channel.remote, "closing connection");
                    break;
                }
            }
            command = writer_rx.recv() => {
                match command {
                    Some(command) => {
                        apply_command(command, &mut write_half, &mut reading).await;
                    }
                    None => break,
                }
            }
            read = read_half.read_buf(&mut buf), if reading => {
                match read {
                    Ok(0) => {
                        debug!(remote = %channel.remote, "connection closed by peer");
                        break;
                    }
                    Ok(_) => {
                        if !drain_frames(&node, &channel, &mut buf, &mut write_half).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(remote = %channel.remote, error = %e, "read failed");
                        break;
                    }
                }
            }
        }
    }
}

async fn apply_command(command: WriteCommand, write_half: &mut OwnedWriteHalf, reading: &mut bool) {
    match command {
        WriteCommand::Frame(bytes, ack) => {
            if let Err(e) = write_half.write_all(&bytes).await {
                debug!(error = %e, "write failed");
            }
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        WriteCommand::ShutdownWrite(ack) => {
            if let Err(e) = write_half.shutdown().await {
                debug!(error = %e, "write shutdown failed");
            }
            let _ = ack.send(());
        }
        WriteCommand::DisableRead(ack) => {
            *reading = false;
            let _ = ack.send(());
        }
    }
}

/// Parse and dispatch every complete frame in the read buffer.
/// Returns false when the connection must close (malformed input).
async fn drain_frames(
    node: &Arc<BoundNode>,
    channel: &Arc<ClientChannel>,
    buf: &mut BytesMut,
    write_half: &mut OwnedWriteHalf,
) -> bool {
    loop {
        let frame = match parse_frame(buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => return true,
            Err(e) => {
                warn!(remote = %channel.remote, error = %e, "malformed frame, closing connection");
                return false;
            }
        };
        match node.handle_frame(channel, &frame).await {
            Outcome::None => {}
            Outcome::Reply(message) => {
                write_response(write_half, &frame.respond(message)).await;
            }
            Outcome::ReplyThenTransition(message, scope) => {
                // The response must be handed to the transport before the
                // listener transition begins.
                write_response(write_half, &frame.respond(message)).await;
                node.run_reject_transition(scope).await;
            }
        }
    }
}

async fn write_response(write_half: &mut OwnedWriteHalf, frame: &Frame) {
    let mut out = BytesMut::new();
    encode_frame(frame, &mut out);
    if let Err(e) = write_half.write_all(&out).await {
        debug!(error = %e, "response write failed");
    }
}
