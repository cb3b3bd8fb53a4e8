//! Delivery thread.
//!
//! The transport reader only enqueues. Anything that runs application code
//! (target observers, client-state observers) happens here instead, one job
//! at a time, in the order the reader produced them.

use std::sync::Weak;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use super::client::BusInner;
use super::envelope::ClientState;
use crate::types::{ClientId, Result, TargetId};

#[derive(Debug)]
pub(crate) enum DeliveryJob {
    /// Drain a target into its observer while the observer stays enabled.
    Kick(TargetId),
    /// Tell client observers a peer changed state.
    ClientState(ClientId, ClientState),
}

pub(crate) fn spawn(
    name: String,
    inner: Weak<BusInner>,
    mut rx: mpsc::UnboundedReceiver<DeliveryJob>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new().name(name).spawn(move || {
        while let Some(job) = rx.blocking_recv() {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match job {
                DeliveryJob::Kick(id) => inner.drain_to_observer(&id),
                DeliveryJob::ClientState(client, state) => {
                    inner.notify_client_observers(client, state)
                }
            }
        }
        tracing::debug!("bus delivery thread exiting");
    })?;
    Ok(handle)
}
