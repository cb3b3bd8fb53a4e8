//! Wait/selector engine.
//!
//! `wait` blocks the calling thread on one target until a caller-supplied
//! [`Selector`] accepts an envelope. It is the only blocking primitive the
//! bus exposes and backs plain consumer loops, control-protocol replies and
//! object-proxy replies alike.
//!
//! Scan rules:
//!   - every wake-up after an arrival or removal rescans the queue from the
//!     head, in arrival order
//!   - an envelope under evaluation is marked in-process; other waiters
//!     skip it and look again once it is released
//!   - `Accept` removes and returns, `Discard` removes, `Continue` leaves it
//!     in place without waking anyone, unless a waiter skipped it meanwhile
//!   - when nothing matches, the selector is polled with `None` so it can
//!     give up on a peer it already knows is dead

use parking_lot::MutexGuard;
use std::time::Instant;

use super::envelope::Envelope;
use super::target::{Target, TargetQueue};
use crate::types::{Error, Result};

/// Selector verdict for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Remove the envelope and hand it to this waiter.
    Accept,
    /// Remove the envelope; nobody gets it.
    Discard,
    /// Leave it for someone else.
    Continue,
}

/// Admission predicate applied by [`Target::wait`].
///
/// `admit(None)` is the liveness poll issued when the queue holds nothing
/// acceptable. Returning anything but [`Admit::Continue`] from the poll ends
/// the wait with [`Error::PeerGone`].
pub trait Selector {
    fn admit(&mut self, envelope: Option<&Envelope>) -> Admit;
}

impl<F> Selector for F
where
    F: FnMut(Option<&Envelope>) -> Admit,
{
    fn admit(&mut self, envelope: Option<&Envelope>) -> Admit {
        self(envelope)
    }
}

/// Selector that accepts the first data envelope, optionally only from one sender.
///
/// Client up/down notices are discarded unless `notices` is set, so a plain
/// consumer loop does not leave them piling up on a target with no observer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMessage {
    pub from: Option<crate::types::ClientId>,
    pub notices: bool,
}

impl AnyMessage {
    /// Accept notices as well as data.
    pub fn with_notices() -> Self {
        Self {
            from: None,
            notices: true,
        }
    }
}

impl Selector for AnyMessage {
    fn admit(&mut self, envelope: Option<&Envelope>) -> Admit {
        let Some(env) = envelope else {
            return Admit::Continue;
        };
        if env.payload().is_none() && !self.notices {
            return Admit::Discard;
        }
        match self.from {
            Some(sender) if sender != env.sender => Admit::Continue,
            _ => Admit::Accept,
        }
    }
}

impl Target {
    /// Block until `selector` accepts an envelope, `deadline` passes or
    /// `gate` reports the bus is unusable.
    ///
    /// `gate` runs with the target lock held and must only read state.
    pub(crate) fn wait(
        &self,
        deadline: Option<Instant>,
        selector: &mut dyn Selector,
        gate: &dyn Fn(&TargetQueue) -> Result<()>,
    ) -> Result<Envelope> {
        let mut q = self.queue.lock();
        // Entries this waiter passed over because another waiter held them.
        let mut skipped: Vec<u64> = Vec::new();
        let mut full = true;
        loop {
            gate(&q)?;
            let mut seen = q.epoch;
            let mut still_skipped = Vec::new();

            // Scan from the head, or only the skipped entries when nothing
            // was added or removed since the last pass.
            let mut cursor: Option<u64> = None;
            while let Some(pos) = q
                .entries
                .iter()
                .position(|p| cursor.map_or(true, |c| p.seq > c) && (full || skipped.contains(&p.seq)))
            {
                let entry = &mut q.entries[pos];
                cursor = Some(entry.seq);
                if entry.in_process {
                    entry.contended = true;
                    still_skipped.push(entry.seq);
                    continue;
                }
                entry.in_process = true;
                let (seq, envelope) = (entry.seq, entry.envelope.clone());

                let verdict = MutexGuard::unlocked(&mut q, || selector.admit(Some(&envelope)));

                // In-process entries are never removed by anyone else.
                let Some(pos) = q.entries.iter().position(|p| p.seq == seq) else {
                    return Err(Error::internal("in-process envelope vanished"));
                };
                match verdict {
                    Admit::Accept => {
                        q.entries.remove(pos);
                        q.epoch += 1;
                        self.cond.notify_all();
                        return Ok(envelope);
                    }
                    Admit::Discard => {
                        q.entries.remove(pos);
                        q.epoch += 1;
                        seen += 1;
                        self.cond.notify_all();
                    }
                    Admit::Continue => {
                        let entry = &mut q.entries[pos];
                        entry.in_process = false;
                        if std::mem::take(&mut entry.contended) {
                            self.cond.notify_all();
                        }
                    }
                }
            }
            skipped = still_skipped;

            // Nothing acceptable is queued: liveness poll.
            if MutexGuard::unlocked(&mut q, || selector.admit(None)) != Admit::Continue {
                return Err(Error::peer_gone(format!(
                    "wait on {} abandoned: awaited peer is down",
                    self.id
                )));
            }

            // The queue changed while we were evaluating; rescan right away.
            if q.epoch != seen {
                full = true;
                continue;
            }
            // A skipped entry was released in the meantime.
            if skipped
                .iter()
                .any(|s| q.entries.iter().any(|p| p.seq == *s && !p.in_process))
            {
                full = false;
                continue;
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut q, deadline).timed_out() {
                        gate(&q)?;
                        return Err(Error::timeout(format!("no matching message on {}", self.id)));
                    }
                }
                None => self.cond.wait(&mut q),
            }
            full = q.epoch != seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::ClientState;
    use crate::types::{ClientId, TargetId};
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn open(_: &TargetQueue) -> Result<()> {
        Ok(())
    }

    fn msg(sender: u32, body: &'static [u8]) -> Envelope {
        Envelope::data(ClientId::new(sender), TargetId::from_u128(1), Bytes::from_static(body))
    }

    fn soon() -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(200))
    }

    #[test]
    fn test_accept_returns_first_match_in_order() {
        let target = Target::new(TargetId::from_u128(1));
        target.push(msg(1, b"a"));
        target.push(msg(2, b"b"));
        target.push(msg(2, b"c"));

        let mut sel = AnyMessage {
            from: Some(ClientId::new(2)),
            ..AnyMessage::default()
        };
        let got = target.wait(soon(), &mut sel, &open).unwrap();
        assert_eq!(got.payload().unwrap().as_ref(), b"b");
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn test_discard_drops_without_returning() {
        let target = Target::new(TargetId::from_u128(1));
        target.push(Envelope::client_state(ClientId::new(3), TargetId::from_u128(1), ClientState::Down));
        target.push(msg(1, b"x"));

        let mut sel = |env: Option<&Envelope>| match env {
            Some(e) if e.client_state_change().is_some() => Admit::Discard,
            Some(_) => Admit::Accept,
            None => Admit::Continue,
        };
        let got = target.wait(soon(), &mut sel, &open).unwrap();
        assert_eq!(got.payload().unwrap().as_ref(), b"x");
        assert_eq!(target.len(), 0);
    }

    #[test]
    fn test_timeout_when_nothing_matches() {
        let target = Target::new(TargetId::from_u128(1));
        target.push(msg(1, b"x"));
        let mut sel = AnyMessage {
            from: Some(ClientId::new(9)),
            ..AnyMessage::default()
        };
        let err = target
            .wait(Some(Instant::now() + Duration::from_millis(30)), &mut sel, &open)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn test_liveness_poll_fails_fast() {
        let target = Target::new(TargetId::from_u128(1));
        let mut polls = 0;
        let mut sel = |env: Option<&Envelope>| match env {
            None => {
                polls += 1;
                Admit::Discard
            }
            Some(_) => Admit::Continue,
        };
        let err = target.wait(None, &mut sel, &open).unwrap_err();
        assert!(matches!(err, Error::PeerGone(_)));
        assert_eq!(polls, 1);
    }

    #[test]
    fn test_gate_failure_wakes_blocked_waiter() {
        let target = Arc::new(Target::new(TargetId::from_u128(1)));
        let t2 = target.clone();
        let waiter = std::thread::spawn(move || {
            let mut sel = AnyMessage::default();
            t2.wait(None, &mut sel, &|q: &TargetQueue| {
                if q.removed {
                    Err(Error::peer_gone("gone"))
                } else {
                    Ok(())
                }
            })
        });
        std::thread::sleep(Duration::from_millis(50));
        target.mark_removed();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::PeerGone(_)));
    }

    #[test]
    fn test_blocked_waiter_sees_later_arrival() {
        let target = Arc::new(Target::new(TargetId::from_u128(1)));
        let t2 = target.clone();
        let waiter = std::thread::spawn(move || {
            let mut sel = AnyMessage::default();
            t2.wait(Some(Instant::now() + Duration::from_secs(5)), &mut sel, &open)
        });
        std::thread::sleep(Duration::from_millis(30));
        target.push(msg(4, b"late"));
        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got.sender, ClientId::new(4));
    }

    #[test]
    fn test_plain_consumer_drops_client_notices() {
        let id = TargetId::from_u128(1);
        let target = Target::new(id);
        for client in 1..=100u32 {
            target.push(Envelope::client_state(ClientId::new(client), id, ClientState::Up));
            target.push(Envelope::client_state(ClientId::new(client), id, ClientState::Down));
        }
        target.push(msg(1, b"data"));

        let got = target.wait(soon(), &mut AnyMessage::default(), &open).unwrap();
        assert_eq!(got.payload().unwrap().as_ref(), b"data");
        assert_eq!(target.len(), 0);

        target.push(Envelope::client_state(ClientId::new(5), id, ClientState::Down));
        let got = target.wait(soon(), &mut AnyMessage::with_notices(), &open).unwrap();
        assert_eq!(got.client_state_change(), Some(ClientState::Down));
    }

    #[test]
    fn test_unmatched_entry_does_not_keep_waiters_busy() {
        let target = Arc::new(Target::new(TargetId::from_u128(1)));
        target.push(msg(9, b"unclaimed"));
        let admits = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let target = target.clone();
                let admits = admits.clone();
                std::thread::spawn(move || {
                    let mut sel = |env: Option<&Envelope>| {
                        if env.is_some() {
                            admits.fetch_add(1, Ordering::SeqCst);
                        }
                        Admit::Continue
                    };
                    target.wait(Some(Instant::now() + Duration::from_millis(300)), &mut sel, &open)
                })
            })
            .collect();
        for waiter in waiters {
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, Error::Timeout(_)), "{:?}", err);
        }

        let admits = admits.load(Ordering::SeqCst);
        assert!(admits <= 8, "{} admit calls for one unclaimed entry", admits);
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn test_concurrent_waiters_split_by_sender_keep_order() {
        const PER_SENDER: u8 = 30;
        const SENDERS: u32 = 3;
        let target = Arc::new(Target::new(TargetId::from_u128(1)));
        target.push(msg(9, b"unclaimed"));
        let done = Arc::new(Barrier::new(SENDERS as usize));

        let waiters: Vec<_> = (1..=SENDERS)
            .map(|sender| {
                let target = target.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut sel = AnyMessage {
                        from: Some(ClientId::new(sender)),
                        ..AnyMessage::default()
                    };
                    let mut got = Vec::new();
                    for _ in 0..PER_SENDER {
                        let env = target
                            .wait(Some(Instant::now() + Duration::from_secs(5)), &mut sel, &open)
                            .unwrap();
                        assert_eq!(env.sender, ClientId::new(sender));
                        got.push(env.payload().unwrap()[0]);
                    }

                    // Only the unclaimed entry is left; waiting on it must stay quiet.
                    done.wait();
                    let mut idle = 0usize;
                    let mut quiet = |env: Option<&Envelope>| {
                        if env.is_some() {
                            idle += 1;
                        }
                        Admit::Continue
                    };
                    let res = target.wait(Some(Instant::now() + Duration::from_millis(200)), &mut quiet, &open);
                    assert!(matches!(res, Err(Error::Timeout(_))));
                    (got, idle)
                })
            })
            .collect();

        for i in 0..PER_SENDER {
            for sender in 1..=SENDERS {
                target.push(Envelope::data(
                    ClientId::new(sender),
                    TargetId::from_u128(1),
                    Bytes::from(vec![i]),
                ));
            }
        }

        for waiter in waiters {
            let (got, idle) = waiter.join().unwrap();
            assert_eq!(got, (0..PER_SENDER).collect::<Vec<_>>());
            assert!(idle <= 4, "{} admit calls while idle", idle);
        }
        assert_eq!(target.len(), 1);
    }

    proptest! {
        // Selecting by sender yields that sender's messages in arrival order.
        #[test]
        fn prop_per_sender_order_survives_selection(senders in proptest::collection::vec(1u32..4, 0..40)) {
            let target = Target::new(TargetId::from_u128(1));
            for (i, sender) in senders.iter().enumerate() {
                target.push(Envelope::data(
                    ClientId::new(*sender),
                    TargetId::from_u128(1),
                    Bytes::from(vec![i as u8]),
                ));
            }
            for sender in 1u32..4 {
                let expected: Vec<u8> = senders
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| **s == sender)
                    .map(|(i, _)| i as u8)
                    .collect();
                let mut sel = AnyMessage {
                    from: Some(ClientId::new(sender)),
                    ..AnyMessage::default()
                };
                let got: Vec<u8> = expected
                    .iter()
                    .map(|_| target.wait(soon(), &mut sel, &open).unwrap().payload().unwrap()[0])
                    .collect();
                prop_assert_eq!(got, expected);
            }
            prop_assert_eq!(target.len(), 0);
        }
    }
}
