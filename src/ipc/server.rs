//! TCP broker server: accept loop and per-connection reader/writer.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, ClientSink};
use crate::ipc::codec::{decode_envelope, encode_envelope, read_frame, write_frame, MSG_ENVELOPE};
use crate::types::{BrokerConfig, ClientId, Error, Result, TargetId};

/// Outbound queue of one TCP connection; drained by its writer task.
#[derive(Debug)]
struct TcpSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ClientSink for TcpSink {
    fn deliver(&self, sender: ClientId, target: TargetId, payload: Bytes) -> Result<()> {
        self.tx
            .send(encode_envelope(sender, target, &payload))
            .map_err(|_| Error::peer_gone("connection writer is gone"))
    }
}

/// Broker daemon front end.
#[derive(Debug)]
pub struct BrokerServer {
    broker: Arc<Broker>,
    config: BrokerConfig,
    listener: Mutex<Option<TcpListener>>,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl BrokerServer {
    /// Bind `config.listen_addr`. Port `0` picks a free port; see
    /// [`BrokerServer::local_addr`].
    pub async fn bind(broker: Arc<Broker>, config: BrokerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            broker,
            config,
            listener: Mutex::new(Some(listener)),
            addr,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Run the accept loop until [`BrokerServer::shutdown`] is called.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "server is already serving")
        })?;
        let conn_semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!(
            "broker listening on {} (max_connections={})",
            self.addr,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("broker server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };

                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        "connection from {} (active={})",
                        peer,
                        self.config.max_connections - conn_semaphore.available_permits(),
                    );
                    let broker = self.broker.clone();
                    let cancel = self.cancel.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, broker, cancel, config, permit).await {
                            tracing::warn!("connection from {} error: {}", peer, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// One client connection: attach, pump frames into the broker, detach.
async fn handle_connection(
    stream: TcpStream,
    broker: Arc<Broker>,
    cancel: CancellationToken,
    config: BrokerConfig,
    _permit: OwnedSemaphorePermit,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let id = broker
        .attach(Arc::new(TcpSink { tx }))
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let conn_cancel = cancel.child_token();
    let writer_task = tokio::spawn(write_loop(writer, rx, conn_cancel.clone(), config.write_timeout));

    let result = loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break Ok(()),
            frame = read_frame(&mut reader, config.max_frame_bytes) => {
                let (msg_type, body) = match frame {
                    Ok(Some(f)) => f,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                };
                if msg_type != MSG_ENVELOPE {
                    tracing::warn!("{}: unexpected frame type 0x{:02X}; dropped", id, msg_type);
                    continue;
                }
                match decode_envelope(body) {
                    Ok((_, target, payload)) => broker.handle_frame(id, target, payload),
                    Err(e) => tracing::warn!("{}: malformed frame: {}", id, e),
                }
            }
        }
    };

    conn_cancel.cancel();
    broker.detach(id);
    if let Err(e) = writer_task.await {
        tracing::debug!("{}: writer task ended abnormally: {}", id, e);
    }
    tracing::debug!("{}: connection closed", id);
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = timed_write(&mut writer, &frame, write_timeout).await {
            tracing::debug!("write failed: {}", e);
            cancel.cancel();
            break;
        }
    }
}

/// Write a frame with a timeout, so a slow consumer cannot hold its
/// connection open indefinitely.
async fn timed_write(writer: &mut OwnedWriteHalf, frame: &[u8], timeout: Duration) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, frame))
        .await
        .map_err(|_| {
            tracing::warn!("write timeout ({:?}), dropping connection", timeout);
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
