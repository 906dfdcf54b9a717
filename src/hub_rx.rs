//! # Hub RX Dispatcher Module
//!
//! Runs in the radio-receive context and must stay light: it validates the
//! source, refreshes the session peer, completes the reliable-TX slot on a
//! matching ACK, auto-acknowledges reliable frames via the raw path, and
//! turns every other verb into a [`HubCommand`] value for the main loop.
//!
//! The only radio send issued from this context is the auto-ACK; replies,
//! state transitions, and anything touching the expander bus happen on the
//! main loop when it drains the command queue.

use log::{log, Level};

use crate::hub::HubCommand;
use crate::reliable_tx::ReliableTx;
use crate::wire::{ack_frame, extract_id, parse_count, parse_leading_digits, split_verb, Mac};
use crate::{
    HubCommandQueueSender, OutboundFrame, PeerCell, RadioFrame, ReceivedFrame,
    RxFrameQueueReceiver, TxFrameQueueSender,
};

pub(crate) struct HubRx {
    pub peer: &'static PeerCell,
    pub reliable: &'static ReliableTx,
    pub raw_tx: TxFrameQueueSender,
    pub commands: HubCommandQueueSender,
}

impl HubRx {
    pub(crate) fn on_frame(&self, src: Mac, frame: &RadioFrame) {
        if src.is_zero() {
            log!(Level::Warn, "ignoring frame from zero-MAC sender");
            return;
        }
        let Some(text) = frame.text() else {
            log!(Level::Warn, "ignoring undecodable frame from {}", src);
            return;
        };
        log!(Level::Debug, "recv from {}: {}", src, text);

        self.peer.set(src);

        let (verb, args) = split_verb(text);
        if verb.is_empty() {
            return;
        }

        // ACKs carry no content beyond completing the outstanding slot.
        if verb.eq_ignore_ascii_case("ACK") {
            let (id_tok, _) = split_verb(args);
            if let Some(id) = parse_leading_digits(id_tok) {
                if self.reliable.on_ack(id, src) {
                    log!(Level::Debug, "reliable ID={} acknowledged by {}", id, src);
                }
            }
            return;
        }

        // Auto-ACK reliable frames, but only for the active session peer, and
        // always via the raw path so the reply cannot occupy the slot.
        if let Some(id) = extract_id(text) {
            if self.peer.get() == Some(src) {
                let ack = OutboundFrame {
                    dest: src,
                    frame: RadioFrame::from_payload(ack_frame(id).as_str()),
                };
                if self.raw_tx.try_send(ack).is_err() {
                    log!(Level::Warn, "TX frame queue full, dropping ACK {}", id);
                }
            }
        }

        let command = if verb.eq_ignore_ascii_case("WELCOME") {
            HubCommand::Welcome
        } else if verb.eq_ignore_ascii_case("PING") {
            HubCommand::Ping
        } else if verb.eq_ignore_ascii_case("BLINK") {
            HubCommand::Blink(optional_count(args, 3))
        } else if verb.eq_ignore_ascii_case("CHASE") {
            HubCommand::Chase(optional_count(args, 1))
        } else if verb.eq_ignore_ascii_case("MONITOR") {
            HubCommand::Monitor(frame.clone())
        } else if verb.eq_ignore_ascii_case("CHECK") {
            HubCommand::Check(frame.clone())
        } else if verb.eq_ignore_ascii_case("CLEAN") {
            HubCommand::Clean
        } else {
            log!(Level::Info, "ignored: unknown verb '{}' from {}", verb, src);
            return;
        };

        if self.commands.try_send(command).is_err() {
            log!(Level::Warn, "command queue full, dropping '{}' from {}", verb, src);
        }
    }
}

/// Optional repeat-count argument of BLINK/CHASE. Non-numeric tokens (the
/// ` ID=` suffix in particular) leave the default; the result is at least 1.
fn optional_count(args: &str, default: u16) -> u16 {
    let (tok, _) = split_verb(args);
    match parse_count(tok) {
        Some(n) => n.max(1),
        None => default,
    }
}

#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 4))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn hub_rx_task(receiver: RxFrameQueueReceiver, dispatcher: HubRx) -> ! {
    loop {
        let ReceivedFrame { src, frame } = receiver.receive().await;
        dispatcher.on_frame(src, &frame);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::{HubCommandQueue, TxFrameQueue};

    fn station() -> Mac {
        Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])
    }

    fn make_rx() -> (
        HubRx,
        &'static TxFrameQueue,
        &'static HubCommandQueue,
        &'static PeerCell,
        &'static ReliableTx,
    ) {
        let tx: &'static TxFrameQueue = Box::leak(Box::new(TxFrameQueue::new()));
        let commands: &'static HubCommandQueue = Box::leak(Box::new(HubCommandQueue::new()));
        let peer: &'static PeerCell = Box::leak(Box::new(PeerCell::new()));
        let reliable: &'static ReliableTx = Box::leak(Box::new(ReliableTx::new(1000)));
        (
            HubRx {
                peer,
                reliable,
                raw_tx: tx.sender(),
                commands: commands.sender(),
            },
            tx,
            commands,
            peer,
            reliable,
        )
    }

    fn frame(text: &str) -> RadioFrame {
        RadioFrame::from_payload(text)
    }

    #[test]
    fn zero_mac_frames_are_dropped() {
        let (rx, tx, commands, peer, _) = make_rx();
        rx.on_frame(Mac::ZERO, &frame("WELCOME ID=1"));
        assert!(peer.get().is_none());
        assert!(tx.receiver().try_receive().is_err());
        assert!(commands.receiver().try_receive().is_err());
    }

    #[test]
    fn reliable_frames_from_the_session_peer_are_acked() {
        let (rx, tx, commands, peer, _) = make_rx();
        rx.on_frame(station(), &frame("WELCOME ID=17"));
        assert_eq!(peer.get(), Some(station()));

        let ack = tx.receiver().try_receive().unwrap();
        assert_eq!(ack.dest, station());
        assert_eq!(ack.frame.text().unwrap(), "ACK 17");
        assert!(matches!(
            commands.receiver().try_receive().unwrap(),
            HubCommand::Welcome
        ));
    }

    #[test]
    fn acks_complete_the_reliable_slot() {
        let (rx, tx, _, _, reliable) = make_rx();
        reliable.send("READY", station(), embassy_time::Instant::from_millis(0), &tx.sender());
        let _ = tx.receiver().try_receive();

        rx.on_frame(station(), &frame("ACK 1000"));
        assert!(!reliable.is_active());
        // An ACK is never itself acknowledged.
        assert!(tx.receiver().try_receive().is_err());
    }

    #[test]
    fn blink_count_ignores_the_id_suffix() {
        let (rx, _, commands, _, _) = make_rx();
        rx.on_frame(station(), &frame("BLINK ID=5"));
        assert!(matches!(
            commands.receiver().try_receive().unwrap(),
            HubCommand::Blink(3)
        ));
        rx.on_frame(station(), &frame("BLINK 5 ID=6"));
        assert!(matches!(
            commands.receiver().try_receive().unwrap(),
            HubCommand::Blink(5)
        ));
        rx.on_frame(station(), &frame("CHASE 0 ID=7"));
        assert!(matches!(
            commands.receiver().try_receive().unwrap(),
            HubCommand::Chase(1)
        ));
    }

    #[test]
    fn unknown_verbs_are_ignored_without_reply() {
        let (rx, tx, commands, _, _) = make_rx();
        rx.on_frame(station(), &frame("REBOOT"));
        assert!(tx.receiver().try_receive().is_err());
        assert!(commands.receiver().try_receive().is_err());
    }
}
