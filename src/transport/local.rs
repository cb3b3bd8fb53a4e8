//! In-process broker transport.
//!
//! Every connected client gets an unbounded channel and a dedicated reader
//! thread that drains it into the client's [`TransportHandler`], so inbound
//! frames are delivered off the sender's thread exactly as a socket reader
//! would deliver them.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use super::{Transport, TransportHandler};
use crate::broker::{Broker, ClientSink};
use crate::types::{ClientId, Error, Result, TargetId};

enum Inbound {
    Frame(ClientId, TargetId, Bytes),
    Close,
}

#[derive(Debug)]
struct ChannelSink {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ClientSink for ChannelSink {
    fn deliver(&self, sender: ClientId, target: TargetId, payload: Bytes) -> Result<()> {
        self.tx
            .send(Inbound::Frame(sender, target, payload))
            .map_err(|_| Error::peer_gone("local connection closed"))
    }
}

/// An in-process broker that bus clients can connect to directly.
#[derive(Debug, Clone, Default)]
pub struct LocalBroker {
    broker: Arc<Broker>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Attach a new client and start its reader thread.
    pub fn connect(&self, handler: Arc<dyn TransportHandler>) -> Result<Arc<LocalTransport>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.broker.attach(Arc::new(ChannelSink { tx: tx.clone() }))?;

        let reader = std::thread::Builder::new()
            .name(format!("objbroker-local-{}", id.get()))
            .spawn(move || {
                while let Some(item) = rx.blocking_recv() {
                    match item {
                        Inbound::Frame(sender, target, payload) => {
                            handler.on_message(sender, target, payload)
                        }
                        Inbound::Close => break,
                    }
                }
                handler.on_disconnect();
            })?;

        Ok(Arc::new(LocalTransport {
            id,
            broker: self.broker.clone(),
            tx,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        }))
    }
}

/// Client end of a [`LocalBroker`] connection.
#[derive(Debug)]
pub struct LocalTransport {
    id: ClientId,
    broker: Arc<Broker>,
    tx: mpsc::UnboundedSender<Inbound>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inbound::Frame(sender, target, payload) => f
                .debug_tuple("Frame")
                .field(sender)
                .field(target)
                .field(&payload.len())
                .finish(),
            Inbound::Close => f.write_str("Close"),
        }
    }
}

impl LocalTransport {
    /// Id the broker assigned to this connection.
    pub fn client_id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the reader thread to finish delivering. No-op when called
    /// from the reader thread itself.
    pub fn join_reader(&self) {
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("local reader for {} panicked", self.id);
            }
        }
    }
}

impl Transport for LocalTransport {
    fn send(&self, target: TargetId, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::disconnected("local transport closed"));
        }
        self.broker.handle_frame(self.id, target, payload);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broker.detach(self.id);
        // Reader may already be gone; on_disconnect has fired then.
        let _ = self.tx.send(Inbound::Close);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::control::ControlMessage;
    use crate::types::RequestIndex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(ClientId, TargetId, Bytes)>>,
        disconnects: AtomicUsize,
    }

    impl TransportHandler for Recorder {
        fn on_message(&self, sender: ClientId, target: TargetId, payload: Bytes) {
            self.frames.lock().push((sender, target, payload));
        }

        fn on_disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_hello_round_trip_through_reader_thread() {
        let broker = LocalBroker::new();
        let rec = Arc::new(Recorder::default());
        let transport = broker.connect(rec.clone()).unwrap();
        transport
            .send(
                TargetId::CONTROL,
                ControlMessage::Hello {
                    request: RequestIndex(1),
                }
                .encode(),
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rec.frames.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let frames = rec.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            ControlMessage::decode(frames[0].2.clone()).unwrap(),
            ControlMessage::ClientId {
                request: RequestIndex(1),
                client: transport.client_id()
            }
        );
    }

    #[test]
    fn test_close_fires_disconnect_once_and_detaches() {
        let broker = LocalBroker::new();
        let rec = Arc::new(Recorder::default());
        let transport = broker.connect(rec.clone()).unwrap();
        assert_eq!(broker.broker().stats().connected_clients, 1);

        transport.close();
        transport.close();
        transport.join_reader();

        assert_eq!(rec.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(broker.broker().stats().connected_clients, 0);
        assert!(transport.send(TargetId::CONTROL, Bytes::new()).is_err());
    }
}
