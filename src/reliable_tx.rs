//! # Reliable TX Module
//!
//! At-most-one outstanding unicast with ` ID=` framing, ACK matching, and
//! bounded linear-backoff retransmission on top of the connectionless link.
//!
//! The slot is shared between the RX dispatcher (which completes it on a
//! matching ACK) and the main loop (which sends and services it), so it lives
//! behind a short critical section. A new send always cancels the previous
//! transaction: no completion is ever signalled for a superseded frame.
//!
//! Raw sends (live telemetry, one-shot replies) bypass this slot entirely so
//! coalesced best-effort traffic cannot monopolise the single transaction.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use log::{log, Level};

use crate::wire::{frame_with_id, Mac};
use crate::{OutboundFrame, RadioFrame, TxFrameQueueSender};

/// Spacing before the first retransmission.
pub(crate) const RETRY_FIRST_INTERVAL_MS: u64 = 240;
/// Linear backoff step added per retransmission.
pub(crate) const RETRY_STEP_MS: u64 = 80;
/// Backoff clamp.
pub(crate) const RETRY_CLAMP_MS: u64 = 640;
/// Retransmissions after the initial send.
pub(crate) const MAX_RETRIES: u8 = 4;

struct Slot {
    active: bool,
    id: u32,
    peer: Mac,
    frame: RadioFrame,
    last_send: Instant,
    retries_left: u8,
    interval: Duration,
    next_id: u32,
}

pub struct ReliableTx {
    slot: Mutex<CriticalSectionRawMutex, RefCell<Slot>>,
}

impl ReliableTx {
    /// `first_id` seeds the monotonically increasing sequence-ID counter.
    pub const fn new(first_id: u32) -> Self {
        ReliableTx {
            slot: Mutex::new(RefCell::new(Slot {
                active: false,
                id: 0,
                peer: Mac::ZERO,
                frame: RadioFrame::empty(),
                last_send: Instant::from_ticks(0),
                retries_left: 0,
                interval: Duration::from_millis(RETRY_FIRST_INTERVAL_MS),
                next_id: first_id,
            })),
        }
    }

    /// Frames `payload` with a fresh ID and transmits immediately.
    ///
    /// Any outstanding transaction is cancelled first. Broadcast destinations
    /// bypass the slot and go out raw.
    pub fn send(&self, payload: &str, peer: Mac, now: Instant, raw: &TxFrameQueueSender) -> bool {
        if peer.is_zero() {
            log!(Level::Warn, "reliable send with no valid target");
            return false;
        }
        if peer.is_broadcast() {
            transmit(raw, peer, RadioFrame::from_payload(payload));
            return true;
        }
        let frame = self.slot.lock(|slot| {
            let mut slot = slot.borrow_mut();
            slot.active = false;
            slot.interval = Duration::from_millis(RETRY_FIRST_INTERVAL_MS);
            let id = slot.next_id;
            slot.next_id = slot.next_id.wrapping_add(1);
            let Some(framed) = frame_with_id(payload, id) else {
                log!(Level::Error, "payload too long for ID framing, dropping");
                return None;
            };
            slot.id = id;
            slot.peer = peer;
            slot.frame = RadioFrame::from_payload(framed.as_str());
            slot.last_send = now;
            slot.retries_left = MAX_RETRIES;
            slot.active = true;
            Some(slot.frame.clone())
        });
        match frame {
            Some(frame) => {
                transmit(raw, peer, frame);
                true
            }
            None => false,
        }
    }

    /// Drives retransmission. Call on every main-loop pass and between the
    /// steps of long scripted animations.
    pub fn service(&self, now: Instant, raw: &TxFrameQueueSender) {
        let due = self.slot.lock(|slot| {
            let mut slot = slot.borrow_mut();
            if !slot.active {
                return None;
            }
            if now.saturating_duration_since(slot.last_send) < slot.interval {
                return None;
            }
            slot.last_send = now;
            slot.interval = core::cmp::min(
                slot.interval + Duration::from_millis(RETRY_STEP_MS),
                Duration::from_millis(RETRY_CLAMP_MS),
            );
            slot.retries_left -= 1;
            if slot.retries_left == 0 {
                log!(Level::Warn, "no ACK for ID={}, giving up", slot.id);
                slot.active = false;
                slot.interval = Duration::from_millis(RETRY_FIRST_INTERVAL_MS);
            }
            Some((slot.peer, slot.frame.clone()))
        });
        if let Some((peer, frame)) = due {
            transmit(raw, peer, frame);
        }
    }

    /// Completes the outstanding transaction iff both the ID and the source
    /// match. Returns whether anything was completed.
    pub fn on_ack(&self, id: u32, src: Mac) -> bool {
        self.slot.lock(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.active && slot.id == id && slot.peer == src {
                slot.active = false;
                slot.interval = Duration::from_millis(RETRY_FIRST_INTERVAL_MS);
                true
            } else {
                false
            }
        })
    }

    /// Drops any outstanding transaction without completion.
    pub fn cancel(&self) {
        self.slot.lock(|slot| {
            let mut slot = slot.borrow_mut();
            slot.active = false;
            slot.interval = Duration::from_millis(RETRY_FIRST_INTERVAL_MS);
        });
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock(|slot| slot.borrow().active)
    }
}

fn transmit(raw: &TxFrameQueueSender, dest: Mac, frame: RadioFrame) {
    if raw.try_send(OutboundFrame { dest, frame }).is_err() {
        log!(Level::Warn, "TX frame queue full, dropping reliable frame");
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::TxFrameQueue;

    fn t(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn leaked_queue() -> &'static TxFrameQueue {
        Box::leak(Box::new(TxFrameQueue::new()))
    }

    fn peer(last: u8) -> Mac {
        Mac([0x08, 0x3A, 0x8D, 0x15, 0x27, last])
    }

    fn drain_texts(q: &'static TxFrameQueue) -> std::vec::Vec<std::string::String> {
        let mut out = std::vec::Vec::new();
        while let Ok(f) = q.receiver().try_receive() {
            out.push(f.frame.text().unwrap().to_string());
        }
        out
    }

    #[test]
    fn send_frames_and_transmits_immediately() {
        let q = leaked_queue();
        let tx = ReliableTx::new(1000);
        assert!(tx.send("READY", peer(1), t(0), &q.sender()));
        assert!(tx.is_active());
        assert_eq!(drain_texts(q), ["READY ID=1000"]);
    }

    #[test]
    fn single_slot_a_new_send_cancels_the_old() {
        let q = leaked_queue();
        let tx = ReliableTx::new(1000);
        tx.send("READY", peer(1), t(0), &q.sender());
        tx.send("MONITOR-OK", peer(1), t(10), &q.sender());
        assert_eq!(drain_texts(q), ["READY ID=1000", "MONITOR-OK ID=1001"]);

        // The superseded frame's ACK completes nothing.
        assert!(!tx.on_ack(1000, peer(1)));
        assert!(tx.is_active());
        assert!(tx.on_ack(1001, peer(1)));
        assert!(!tx.is_active());

        // No retransmissions after completion.
        tx.service(t(5000), &q.sender());
        assert!(drain_texts(q).is_empty());
    }

    #[test]
    fn ack_requires_both_id_and_source() {
        let q = leaked_queue();
        let tx = ReliableTx::new(1);
        tx.send("READY", peer(1), t(0), &q.sender());
        assert!(!tx.on_ack(2, peer(1)));
        assert!(!tx.on_ack(1, peer(2)));
        assert!(tx.is_active());
        assert!(tx.on_ack(1, peer(1)));
    }

    #[test]
    fn retransmits_with_linear_backoff_then_gives_up() {
        let q = leaked_queue();
        let tx = ReliableTx::new(1000);
        tx.send("MONITOR-OK", peer(1), t(0), &q.sender());
        drain_texts(q);

        // First retransmission comes due a full interval after the send.
        tx.service(t(239), &q.sender());
        assert!(drain_texts(q).is_empty());
        tx.service(t(240), &q.sender());
        assert_eq!(drain_texts(q).len(), 1);

        // Subsequent retries follow the +80 ms schedule: 320, 400, 480.
        tx.service(t(240 + 319), &q.sender());
        assert!(drain_texts(q).is_empty());
        tx.service(t(240 + 320), &q.sender());
        assert_eq!(drain_texts(q).len(), 1);
        tx.service(t(960), &q.sender());
        assert_eq!(drain_texts(q).len(), 1);
        tx.service(t(1440), &q.sender());
        assert_eq!(drain_texts(q).len(), 1);

        // Retries exhausted: the slot is abandoned.
        assert!(!tx.is_active());
        tx.service(t(10_000), &q.sender());
        assert!(drain_texts(q).is_empty());
    }

    #[test]
    fn broadcast_bypasses_the_slot() {
        let q = leaked_queue();
        let tx = ReliableTx::new(50);
        assert!(tx.send("HELLO", Mac::BROADCAST, t(0), &q.sender()));
        assert!(!tx.is_active());
        assert_eq!(drain_texts(q), ["HELLO"]);
    }

    #[test]
    fn cancel_drops_the_transaction() {
        let q = leaked_queue();
        let tx = ReliableTx::new(1);
        tx.send("READY", peer(1), t(0), &q.sender());
        tx.cancel();
        assert!(!tx.is_active());
        tx.service(t(1000), &q.sender());
        drain_texts(q);
        assert!(drain_texts(q).is_empty());
    }
}
