//! Client side of the TCP broker connection.
//!
//! The bus is driven by blocking threads, so the transport owns a small
//! tokio runtime of its own: a reader task feeds the [`TransportHandler`]
//! and a writer task drains an unbounded queue that `send` pushes onto
//! without blocking.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{decode_envelope, encode_envelope, read_frame, MSG_ENVELOPE};
use crate::transport::{Transport, TransportHandler};
use crate::types::{ClientId, Error, Result, TargetId};

pub struct TcpTransport {
    addr: String,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    closed: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TcpTransport {
    /// Connect to a broker at `addr`. Blocks the calling thread until the
    /// TCP connection is up; must not be called from inside a tokio runtime.
    pub fn connect(addr: &str, handler: Arc<dyn TransportHandler>, max_frame_bytes: u32) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("objbroker-tcp")
            .enable_all()
            .build()?;

        let stream = runtime.block_on(tokio::net::TcpStream::connect(addr))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        runtime.spawn(write_loop(writer, rx, cancel.clone()));
        runtime.spawn(read_loop(reader, handler, max_frame_bytes, cancel.clone()));
        tracing::debug!("tcp transport connected to {}", addr);

        Ok(Arc::new(Self {
            addr: addr.to_string(),
            tx,
            cancel,
            closed: AtomicBool::new(false),
            runtime: Mutex::new(Some(runtime)),
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for TcpTransport {
    fn send(&self, target: TargetId, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::disconnected("tcp transport closed"));
        }
        self.tx
            .send(encode_envelope(ClientId::ANY, target, &payload))
            .map_err(|_| Error::disconnected("tcp writer is gone"))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("tcp transport to {} closing", self.addr);
        self.cancel.cancel();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    handler: Arc<dyn TransportHandler>,
    max_frame_bytes: u32,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader, max_frame_bytes) => {
                let (msg_type, body) = match frame {
                    Ok(Some(f)) => f,
                    Ok(None) => {
                        tracing::info!("broker closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("tcp read failed: {}", e);
                        break;
                    }
                };
                if msg_type != MSG_ENVELOPE {
                    tracing::warn!("unexpected frame type 0x{:02X} from broker; dropped", msg_type);
                    continue;
                }
                match decode_envelope(body) {
                    Ok((sender, target, payload)) => handler.on_message(sender, target, payload),
                    Err(e) => tracing::warn!("malformed frame from broker: {}", e),
                }
            }
        }
    }
    cancel.cancel();
    handler.on_disconnect();
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!("tcp write failed: {}", e);
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}
