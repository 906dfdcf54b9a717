//! # Station Bridge Module
//!
//! Operator-facing side of the link: one console line in, one framed command
//! out, with the same ID/ACK/backoff contract as the hub's reliable slot.
//!
//! The console loop parses a line (optionally wrapped in `cmd='…'`), requires
//! a trailing MAC token, validates the verb, and sends with retries until the
//! matching `ACK <id>` arrives from that MAC. While a MONITOR/CHECK session is
//! bound to a hub, `EV` and `UI:` frames from that hub are forwarded to the
//! console; everything else is logged with a source header. A session ends on
//! `RESULT …`, `SUCCESS`, `FAILURE`, or `CLEAN-OK`.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use log::{log, Level};

use crate::reliable_tx::{MAX_RETRIES, RETRY_CLAMP_MS, RETRY_STEP_MS};
use crate::wire::{
    ack_frame, extract_id, frame_with_id, is_mac_token, parse_leading_digits, parse_pure_channel,
    split_verb, Mac, Payload, Tokens,
};
use crate::{
    ConsoleLine, ConsoleLineQueueReceiver, ConsoleOutQueueSender, OutboundFrame, PeerCell,
    RadioFrame, ReceivedFrame, RxFrameQueueReceiver, TxFrameQueueSender,
};

/// Spacing before the station's first retransmission.
pub(crate) const STA_ACK_TIMEOUT_MS: u64 = 220;
/// Upper bound on channels in a CHECK list sent from the console.
pub(crate) const CHECK_MAX_PINS: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum StationState {
    Idle,
    WaitHello,
    WaitResult,
}

impl StationState {
    fn from_u8(v: u8) -> StationState {
        match v {
            1 => StationState::WaitHello,
            2 => StationState::WaitResult,
            _ => StationState::Idle,
        }
    }
}

/// One-shot ACK rendezvous: the console loop arms it with the in-flight
/// `(id, peer)` tuple, the RX context completes it on a match.
pub(crate) struct AckWait {
    wait: Mutex<CriticalSectionRawMutex, Cell<(u32, Mac)>>,
    done: Signal<CriticalSectionRawMutex, ()>,
}

impl AckWait {
    pub(crate) const fn new() -> Self {
        AckWait {
            wait: Mutex::new(Cell::new((0, Mac::ZERO))),
            done: Signal::new(),
        }
    }

    fn arm(&self, id: u32, peer: Mac) {
        self.wait.lock(|w| w.set((id, peer)));
        self.done.reset();
    }

    /// Completes the wait iff both the ID and the source match.
    pub(crate) fn complete(&self, id: u32, src: Mac) -> bool {
        let (wait_id, wait_mac) = self.wait.lock(|w| w.get());
        if id != 0 && id == wait_id && src == wait_mac {
            self.done.signal(());
            true
        } else {
            false
        }
    }

    async fn acked(&self) {
        self.done.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn is_signaled(&self) -> bool {
        self.done.signaled()
    }
}

/// State shared between the console loop and the RX context.
pub struct StationShared {
    pub(crate) session: PeerCell,
    pub(crate) expected: PeerCell,
    pub(crate) ack: AckWait,
    pub(crate) forward_live: AtomicBool,
    state: AtomicU8,
    seq: AtomicU32,
}

impl StationShared {
    pub const fn new() -> Self {
        StationShared {
            session: PeerCell::new(),
            expected: PeerCell::new(),
            ack: AckWait::new(),
            forward_live: AtomicBool::new(false),
            state: AtomicU8::new(StationState::Idle as u8),
            seq: AtomicU32::new(1),
        }
    }

    pub(crate) fn state(&self) -> StationState {
        StationState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: StationState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn end_session(&self) {
        self.forward_live.store(false, Ordering::Relaxed);
        self.session.clear();
    }
}

/// Extracts `(payload, mac)` from one console line.
///
/// A `cmd='…'` / `cmd="…"` wrapper is unwrapped first. The MAC must be the
/// rightmost token and terminal; zero MACs are rejected and scanning
/// continues leftwards past false matches.
pub fn parse_line(line: &str) -> Option<(Payload, Mac)> {
    let mut s = line.trim();
    if let Some(pos) = s.find("cmd='") {
        if let Some(len) = s[pos + 5..].find('\'') {
            s = &s[pos + 5..pos + 5 + len];
        }
    } else if let Some(pos) = s.find("cmd=\"") {
        if let Some(len) = s[pos + 5..].find('"') {
            s = &s[pos + 5..pos + 5 + len];
        }
    }
    s = s.trim();
    if s.len() < 17 {
        return None;
    }
    let mut i = s.len() - 17;
    loop {
        if let Some(tok) = s.get(i..i + 17) {
            if is_mac_token(tok) && s[i + 17..].trim().is_empty() {
                if let Some(mac) = Mac::parse(tok) {
                    if !mac.is_zero() {
                        let mut payload = Payload::new();
                        payload.push_str(s[..i].trim()).ok()?;
                        return Some((payload, mac));
                    }
                }
            }
        }
        if i == 0 {
            return None;
        }
        i -= 1;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LineVerb {
    Welcome,
    Monitor,
    Check,
    Ping,
    Clean,
    /// HELLO/READY echoed back by the host; silently ignored.
    Noise,
    Unknown,
}

pub(crate) fn classify(payload: &str) -> LineVerb {
    let (verb, _) = split_verb(payload);
    if verb.eq_ignore_ascii_case("WELCOME") {
        LineVerb::Welcome
    } else if verb.eq_ignore_ascii_case("MONITOR") {
        LineVerb::Monitor
    } else if verb.eq_ignore_ascii_case("CHECK") {
        LineVerb::Check
    } else if verb.eq_ignore_ascii_case("PING") {
        LineVerb::Ping
    } else if verb.eq_ignore_ascii_case("CLEAN") {
        LineVerb::Clean
    } else if verb.eq_ignore_ascii_case("HELLO") || verb.eq_ignore_ascii_case("READY") {
        LineVerb::Noise
    } else {
        LineVerb::Unknown
    }
}

/// Validates the channel list of a console CHECK: pure integers 1..40, at
/// most [`CHECK_MAX_PINS`], and non-empty. The hub itself tolerates an empty
/// selection; the console does not send one.
pub(crate) fn validate_check_args(args: &str) -> bool {
    let mut count = 0;
    for tok in Tokens::csv(args) {
        if parse_pure_channel(tok).is_none() {
            return false;
        }
        count += 1;
        if count > CHECK_MAX_PINS {
            return false;
        }
    }
    count > 0
}

fn console_push(console: &ConsoleOutQueueSender, args: core::fmt::Arguments<'_>) {
    let mut line = ConsoleLine::new();
    let _ = core::fmt::write(&mut line, args);
    if console.try_send(line).is_err() {
        log!(Level::Warn, "console queue full, dropping line");
    }
}

pub(crate) struct StationRx {
    pub shared: &'static StationShared,
    pub console: ConsoleOutQueueSender,
    pub raw_tx: TxFrameQueueSender,
}

impl StationRx {
    pub(crate) fn on_frame(&self, src: Mac, frame: &RadioFrame) {
        if src.is_zero() {
            return;
        }
        let Some(text) = frame.text() else {
            return;
        };

        if let Some(rest) = text.strip_prefix("ACK ") {
            let (id_tok, _) = split_verb(rest);
            if let Some(id) = parse_leading_digits(id_tok) {
                self.shared.ack.complete(id, src);
            }
            return;
        }

        // Auto-ACK reliable frames, gated to the in-flight target or the
        // bound session hub.
        if let Some(id) = extract_id(text) {
            let expected = self.shared.expected.get() == Some(src);
            let session = self.shared.forward_live.load(Ordering::Relaxed)
                && self.shared.session.get() == Some(src);
            if expected || session {
                let out = OutboundFrame {
                    dest: src,
                    frame: RadioFrame::from_payload(ack_frame(id).as_str()),
                };
                if self.raw_tx.try_send(out).is_err() {
                    log!(Level::Warn, "TX frame queue full, dropping ACK {}", id);
                }
            }
        }

        // EV/UI fast paths bypass the header logging.
        if text.starts_with("EV ") {
            if self.shared.forward_live.load(Ordering::Relaxed) {
                let session = self.shared.session.get();
                if session.is_none() || session == Some(src) {
                    console_push(&self.console, format_args!("{}", text));
                }
            }
            return;
        }
        if let Some(rest) = text.strip_prefix("UI:") {
            if self.shared.forward_live.load(Ordering::Relaxed) {
                console_push(&self.console, format_args!("UI {} {}", rest, src));
            }
            return;
        }

        console_push(&self.console, format_args!("reply from {}: {}", src, text));

        if text.starts_with("MONITOR-OK")
            || text.starts_with("PING-OK")
            || text.starts_with("CLEAN-OK")
        {
            if text.starts_with("CLEAN-OK") {
                self.shared.end_session();
            }
            self.shared.expected.clear();
            return;
        }

        if text.starts_with("RESULT ") || text.starts_with("SUCCESS") || text.starts_with("FAILURE")
        {
            self.shared.end_session();
            self.shared.set_state(StationState::Idle);
            self.shared.expected.clear();
            return;
        }

        // With a transaction in flight, drop frames from anyone else.
        if let Some(expected) = self.shared.expected.get() {
            if src != expected {
                console_push(
                    &self.console,
                    format_args!("ignored: unexpected MAC, expected {} got {}", expected, src),
                );
                return;
            }
        }

        if self.shared.state() == StationState::WaitHello
            && (text.starts_with("READY") || text.starts_with("WELCOME"))
        {
            let verb = if text.starts_with("READY") { "READY" } else { "WELCOME" };
            console_push(&self.console, format_args!("{} {}", verb, src));
            self.shared.set_state(StationState::Idle);
            self.shared.expected.clear();
        }
    }
}

/// Sends one framed command and waits for its ACK, retrying on the linear
/// backoff schedule. At most one transaction is in flight: the console loop
/// is the only sender and blocks here until the transaction resolves.
async fn send_with_ack(
    shared: &'static StationShared,
    raw_tx: &TxFrameQueueSender,
    console: &ConsoleOutQueueSender,
    payload: &str,
    mac: Mac,
) -> bool {
    let id = shared.seq.fetch_add(1, Ordering::Relaxed);
    let Some(framed) = frame_with_id(payload, id) else {
        console_push(console, format_args!("ERROR: framed payload too long"));
        return false;
    };
    shared.ack.arm(id, mac);

    let mut interval = Duration::from_millis(STA_ACK_TIMEOUT_MS);
    let mut attempts: u8 = 0;
    loop {
        let out = OutboundFrame {
            dest: mac,
            frame: RadioFrame::from_payload(framed.as_str()),
        };
        if raw_tx.try_send(out).is_err() {
            log!(Level::Warn, "TX frame queue full, delaying command send");
        }
        attempts += 1;
        log!(Level::Debug, "sent '{}' to {} (attempt {})", framed.as_str(), mac, attempts);

        match select(shared.ack.acked(), Timer::after(interval)).await {
            Either::First(()) => return true,
            Either::Second(()) => {
                if attempts > MAX_RETRIES {
                    console_push(
                        console,
                        format_args!("WARN: no ACK for ID={} after {} attempts", id, attempts),
                    );
                    return false;
                }
                interval = core::cmp::min(
                    interval + Duration::from_millis(RETRY_STEP_MS),
                    Duration::from_millis(RETRY_CLAMP_MS),
                );
            }
        }
    }
}

fn banner(console: &ConsoleOutQueueSender) {
    console_push(console, format_args!("station ready, usage:"));
    console_push(console, format_args!("  WELCOME <MAC>"));
    console_push(console, format_args!("  MONITOR NORMAL ... LATCH ... <MAC>"));
    console_push(console, format_args!("  CHECK 5,6,10 <MAC>"));
    console_push(console, format_args!("  PING <MAC> | CLEAN <MAC>"));
    console_push(console, format_args!("  also: cmd='CHECK 5,6 <MAC>'"));
}

#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 4))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn station_main_task(
    lines: ConsoleLineQueueReceiver,
    console: ConsoleOutQueueSender,
    raw_tx: TxFrameQueueSender,
    shared: &'static StationShared,
) -> ! {
    banner(&console);
    loop {
        let line = lines.receive().await;
        let Some((payload, mac)) = parse_line(line.as_str()) else {
            console_push(
                &console,
                format_args!("ERROR: invalid command or MAC in line: '{}'", line.as_str().trim()),
            );
            shared.expected.clear();
            continue;
        };
        shared.expected.set(mac);

        let verb = classify(payload.as_str());
        match verb {
            LineVerb::Noise => {
                console_push(&console, format_args!("note: host noise ignored"));
                shared.expected.clear();
                continue;
            }
            LineVerb::Unknown => {
                console_push(
                    &console,
                    format_args!("ignored: unknown command '{}'", payload.as_str()),
                );
                shared.expected.clear();
                continue;
            }
            _ => {}
        }

        if verb == LineVerb::Check {
            let (_, args) = split_verb(payload.as_str());
            if !validate_check_args(args) {
                console_push(&console, format_args!("ERROR: invalid CHECK pins list"));
                shared.expected.clear();
                continue;
            }
        }

        shared.set_state(match verb {
            LineVerb::Welcome => StationState::WaitHello,
            LineVerb::Check => StationState::WaitResult,
            _ => StationState::Idle,
        });

        // Bind the live-forwarding session while a MONITOR/CHECK runs.
        if verb == LineVerb::Monitor || verb == LineVerb::Check {
            shared.forward_live.store(true, Ordering::Relaxed);
            shared.session.set(mac);
        }
        if verb == LineVerb::Clean {
            shared.end_session();
        }

        if !send_with_ack(shared, &raw_tx, &console, payload.as_str(), mac).await {
            shared.set_state(StationState::Idle);
            shared.expected.clear();
            shared.end_session();
        }
    }
}

#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 4))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn station_rx_task(receiver: RxFrameQueueReceiver, dispatcher: StationRx) -> ! {
    loop {
        let ReceivedFrame { src, frame } = receiver.receive().await;
        dispatcher.on_frame(src, &frame);
    }
}
