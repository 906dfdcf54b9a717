//! # Hub Core Module
//!
//! The test-session state machine and the monitor/check engine.
//!
//! ## Architecture
//!
//! [`HubCore`] is owned by a single main-loop task. The RX dispatcher never
//! touches it: received verbs arrive as [`HubCommand`] values through the
//! command queue, and only the main loop drives the expander bus, the LEDs,
//! and the reply traffic. Heavy actions (BLINK, CHASE, the MONITOR baseline
//! snapshot) go through a single-slot deferred-work holder: the newest
//! request wins, and at most one is drained per loop pass. During scripted
//! animations the reliable-TX slot is serviced between every step so
//! in-flight retries keep progressing.
//!
//! ## Session states
//!
//! - `SELF_CHECK`: waits for all 40 switches to read released.
//! - `WAIT_FOR_TARGET`: idle; held switches blink to surface stuck hardware.
//! - `WELCOME`: all LEDs follow the blink clock for six half-periods.
//! - `MONITORING`: per-tick debounce, latch memory, EV streaming, LED policy,
//!   and the 200 ms auto-final hold.
//! - `FINAL_CHECK`: 5-sample vote spaced 50 ms, strict threshold by default.

use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::channel_model::{ChannelClass, ChannelModel};
use crate::io_map::{ExpanderBus, IoMap};
use crate::reliable_tx::ReliableTx;
use crate::wire::{
    auto_final_frame, event_frame, monitor_assignments, monitor_start_frame,
    parse_check_selection, result_failure_frame, result_success_frame, split_verb, CsvList,
    EventKind, Mac,
};
use crate::{
    OutboundFrame, PeerCell, RadioFrame, TxFrameQueueSender, AUTO_FINAL_HOLD_MS,
    BLINK_INTERVAL_MS, CHANNEL_COUNT, FINAL_CHECK_SAMPLES, MIN_EVENT_GAP_MS, PASS_THRESHOLD,
    SAMPLE_DELAY_MS, WELCOME_BLINK_EDGES,
};

#[cfg(feature = "expander-bus-simulator")]
use crate::{HubCommandQueueReceiver, MAIN_LOOP_TICK_MS};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    SelfCheck,
    WaitForTarget,
    Welcome,
    Monitoring,
    FinalCheck,
}

/// Verb decoded by the RX dispatcher, executed by the main loop.
pub(crate) enum HubCommand {
    /// Local HELLO key: forget the session peer and broadcast HELLO.
    Hello,
    Welcome,
    Ping,
    Blink(u16),
    Chase(u16),
    /// Carries the original frame; the payload is parsed on the main loop.
    Monitor(RadioFrame),
    Check(RadioFrame),
    Clean,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum DeferredKind {
    Blink(u16),
    Chase(u16),
    MonitorBaseline,
}

/// Single-slot deferred work: kind plus the peer captured at enqueue time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DeferredWork {
    pub kind: DeferredKind,
    pub target: Option<Mac>,
}

/// Multi-sample pass/fail decision with early exit in both directions.
pub(crate) struct FinalVote {
    ok: u8,
    taken: u8,
}

#[derive(PartialEq, Eq, Debug)]
pub(crate) enum VoteStep {
    Continue,
    Decided,
}

impl FinalVote {
    pub(crate) fn new() -> Self {
        FinalVote { ok: 0, taken: 0 }
    }

    /// Records one sample. Decides as soon as the threshold is reached or can
    /// no longer be reached with the samples that remain.
    pub(crate) fn record(&mut self, pass: bool) -> VoteStep {
        self.taken += 1;
        if pass {
            self.ok += 1;
        }
        if self.ok >= PASS_THRESHOLD {
            VoteStep::Decided
        } else if self.ok + (FINAL_CHECK_SAMPLES - self.taken) < PASS_THRESHOLD {
            VoteStep::Decided
        } else {
            VoteStep::Continue
        }
    }

    pub(crate) fn passed(&self) -> bool {
        self.ok >= PASS_THRESHOLD
    }
}

pub struct HubCore<B> {
    state: SessionState,
    io: IoMap<B>,
    channels: ChannelModel,
    mac: Mac,
    peer: &'static PeerCell,
    reliable: &'static ReliableTx,
    raw_tx: TxFrameQueueSender,

    blink_on: bool,
    last_blink_tick: Option<Instant>,
    welcome_edges: u8,

    stream_active: bool,
    need_release_gate: bool,
    live_ok_since: Option<Instant>,

    check_select: [bool; CHANNEL_COUNT],
    check_active: bool,
    missing: CsvList,
    extra: CsvList,

    deferred: Option<DeferredWork>,
    final_check_pending: bool,
}

impl<B: ExpanderBus> HubCore<B> {
    pub(crate) fn new(
        io: IoMap<B>,
        mac: Mac,
        peer: &'static PeerCell,
        reliable: &'static ReliableTx,
        raw_tx: TxFrameQueueSender,
        now: Instant,
    ) -> Self {
        // Seed every debouncer from a fresh raw read so switches held during
        // boot cannot fire a phantom first edge.
        let channels = ChannelModel::new(|ch| io.is_pressed_raw(ch), now);
        HubCore {
            state: SessionState::SelfCheck,
            io,
            channels,
            mac,
            peer,
            reliable,
            raw_tx,
            blink_on: false,
            last_blink_tick: None,
            welcome_edges: 0,
            stream_active: false,
            need_release_gate: false,
            live_ok_since: None,
            check_select: [false; CHANNEL_COUNT],
            check_active: false,
            missing: CsvList::new(),
            extra: CsvList::new(),
            deferred: None,
            final_check_pending: false,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn take_deferred(&mut self) -> Option<DeferredWork> {
        self.deferred.take()
    }

    pub(crate) fn take_final_check(&mut self) -> bool {
        core::mem::replace(&mut self.final_check_pending, false)
    }

    /// Retransmission service; inert until self-check has passed.
    pub(crate) fn service_reliable(&self, now: Instant) {
        if self.state == SessionState::SelfCheck {
            self.reliable.cancel();
        } else {
            self.reliable.service(now, &self.raw_tx);
        }
    }

    // ---- outbound helpers ----

    fn send_raw(&self, payload: &str, dest: Mac) {
        if dest.is_zero() {
            log!(Level::Warn, "raw send with no valid target");
            return;
        }
        let out = OutboundFrame {
            dest,
            frame: RadioFrame::from_payload(payload),
        };
        if self.raw_tx.try_send(out).is_err() {
            log!(Level::Warn, "TX frame queue full, dropping raw frame");
        }
    }

    fn send_raw_to_peer(&self, payload: &str) {
        match self.peer.get() {
            Some(p) => self.send_raw(payload, p),
            None => log!(Level::Warn, "raw '{}' without session peer", payload),
        }
    }

    fn send_reliable_to_peer(&self, payload: &str, now: Instant) {
        match self.peer.get() {
            Some(p) => {
                self.reliable.send(payload, p, now, &self.raw_tx);
            }
            None => log!(Level::Warn, "reliable '{}' without session peer", payload),
        }
    }

    /// Throttled live-event emission; events inside the per-channel gap are
    /// dropped, never queued.
    pub(crate) fn send_event(&mut self, kind: EventKind, ch: usize, active: bool, now: Instant) {
        if !self.stream_active {
            return;
        }
        {
            let st = self.channels.state_mut(ch);
            let stamp = match kind {
                EventKind::Pressed => &mut st.last_ev_pressed,
                EventKind::Latched => &mut st.last_ev_latched,
            };
            if let Some(t) = *stamp {
                if now.saturating_duration_since(t) < Duration::from_millis(MIN_EVENT_GAP_MS) {
                    return;
                }
            }
            *stamp = Some(now);
        }
        let Some(peer) = self.peer.get() else {
            return;
        };
        let frame = event_frame(kind, ch, active, &self.mac);
        self.send_raw(frame.as_str(), peer);
    }

    pub(crate) fn start_streaming(&mut self, rebaseline: bool) {
        if self.stream_active && !rebaseline {
            return;
        }
        self.stream_active = true;
        if rebaseline {
            for ch in 0..CHANNEL_COUNT {
                let st = self.channels.state_mut(ch);
                st.prev_pressed = st.debounce.stable();
                st.prev_latched = st.latched;
                st.last_ev_pressed = None;
                st.last_ev_latched = None;
            }
        }
    }

    // ---- session transitions ----

    fn has_work(&self, restrict: bool) -> bool {
        if restrict {
            self.channels.has_work(Some(&self.check_select))
        } else {
            self.channels.has_work(None)
        }
    }

    fn clean_model(&mut self, now: Instant) {
        let io = &self.io;
        self.channels.clean(|ch| io.is_pressed_raw(ch), now);
        self.check_select = [false; CHANNEL_COUNT];
        self.check_active = false;
        self.live_ok_since = None;
        self.io.all_leds(false);
    }

    /// Stops streaming, clears the channel model and LEDs, forgets the
    /// session peer, and returns to idle.
    fn go_dark(&mut self, now: Instant) {
        self.stream_active = false;
        self.clean_model(now);
        self.need_release_gate = false;
        self.peer.clear();
        self.state = SessionState::WaitForTarget;
        log!(Level::Info, "session over, waiting for work");
    }

    fn send_success_and_idle(&mut self, now: Instant) {
        match self.peer.get() {
            Some(p) => {
                let frame = result_success_frame(&self.mac);
                self.reliable.send(frame.as_str(), p, now, &self.raw_tx);
            }
            None => log!(Level::Warn, "success without session target"),
        }
        self.go_dark(now);
    }

    pub(crate) fn dispatch(&mut self, command: HubCommand, now: Instant) {
        match command {
            HubCommand::Hello => {
                self.peer.clear();
                self.send_raw("HELLO", Mac::BROADCAST);
                log!(Level::Info, "HELLO broadcast ({})", self.mac);
            }
            HubCommand::Welcome => {
                self.send_raw_to_peer("WELCOME");
                self.send_reliable_to_peer("READY", now);
                self.state = SessionState::Welcome;
                self.welcome_edges = 0;
                log!(Level::Info, "state -> WELCOME");
            }
            HubCommand::Ping => {
                self.send_raw_to_peer("PING-OK");
            }
            HubCommand::Blink(n) => {
                self.send_reliable_to_peer("BLINK-OK", now);
                self.deferred = Some(DeferredWork {
                    kind: DeferredKind::Blink(n),
                    target: self.peer.get(),
                });
            }
            HubCommand::Chase(n) => {
                self.send_reliable_to_peer("CHASE-OK", now);
                self.deferred = Some(DeferredWork {
                    kind: DeferredKind::Chase(n),
                    target: self.peer.get(),
                });
            }
            HubCommand::Monitor(frame) => self.handle_monitor(&frame, now),
            HubCommand::Check(frame) => self.handle_check(&frame, now),
            HubCommand::Clean => {
                if self.state == SessionState::SelfCheck {
                    log!(Level::Info, "ignored: CLEAN during self check");
                    return;
                }
                let target = self.peer.get();
                self.go_dark(now);
                if let Some(t) = target {
                    self.send_raw("CLEAN-OK", t);
                }
                log!(Level::Info, "model cleaned");
            }
        }
    }

    fn handle_monitor(&mut self, frame: &RadioFrame, now: Instant) {
        let Some(text) = frame.text() else {
            return;
        };
        let (_, args) = split_verb(text);
        for (ch, class) in monitor_assignments(args) {
            let raw = self.io.is_pressed_raw(ch);
            let led = self.channels.assign(ch, class, raw, now);
            self.io.set_led(ch, led);
        }
        if self.state != SessionState::Monitoring {
            // Force a debounce resync so a pre-held switch must be released
            // before edges start counting.
            self.need_release_gate = true;
        }
        self.state = SessionState::Monitoring;
        self.send_reliable_to_peer("MONITOR-OK", now);
        self.deferred = Some(DeferredWork {
            kind: DeferredKind::MonitorBaseline,
            target: self.peer.get(),
        });
        log!(Level::Info, "state -> MONITORING");
    }

    fn handle_check(&mut self, frame: &RadioFrame, now: Instant) {
        if self.state != SessionState::Monitoring {
            log!(Level::Info, "ignored: CHECK outside MONITORING");
            return;
        }
        let Some(text) = frame.text() else {
            return;
        };
        let (_, args) = split_verb(text);
        let (select, any) = parse_check_selection(args);
        self.check_select = select;
        self.check_active = any;
        if !self.has_work(any) {
            log!(Level::Info, "CHECK with nothing to evaluate: SUCCESS");
            self.send_success_and_idle(now);
            return;
        }
        self.state = SessionState::FinalCheck;
        self.final_check_pending = true;
        log!(Level::Info, "state -> FINAL_CHECK");
    }

    // ---- per-tick work ----

    pub(crate) fn tick(&mut self, now: Instant) {
        let blink_edge = match self.last_blink_tick {
            Some(t)
                if now.saturating_duration_since(t)
                    < Duration::from_millis(BLINK_INTERVAL_MS) =>
            {
                false
            }
            _ => {
                self.last_blink_tick = Some(now);
                self.blink_on = !self.blink_on;
                true
            }
        };

        if blink_edge && self.state == SessionState::Welcome {
            self.welcome_edges += 1;
            self.io.all_leds(self.blink_on);
            if self.welcome_edges >= WELCOME_BLINK_EDGES {
                self.welcome_edges = 0;
                self.io.all_leds(false);
                self.state = SessionState::WaitForTarget;
                log!(Level::Info, "state -> WAIT_FOR_TARGET");
            }
        }

        match self.state {
            SessionState::SelfCheck => self.self_check_tick(),
            SessionState::WaitForTarget => self.idle_tick(),
            SessionState::Monitoring => self.monitoring_tick(now),
            // WELCOME is driven by the blink clock above; FINAL_CHECK runs as
            // a sampled procedure from the main loop.
            SessionState::Welcome | SessionState::FinalCheck => {}
        }
    }

    fn self_check_tick(&mut self) {
        let mut any_pressed = false;
        for ch in 0..CHANNEL_COUNT {
            let pressed = self.io.is_pressed_raw(ch);
            self.io.set_led(ch, self.blink_on && pressed);
            if pressed {
                any_pressed = true;
            }
        }
        if !any_pressed {
            self.state = SessionState::WaitForTarget;
            log!(Level::Info, "self check passed, waiting for MONITOR");
        }
    }

    /// Idle: blink any switch that is stuck pressed.
    fn idle_tick(&mut self) {
        for ch in 0..CHANNEL_COUNT {
            let pressed = self.io.is_pressed_raw(ch);
            self.io.set_led(ch, pressed && self.blink_on);
        }
    }

    fn monitoring_tick(&mut self, now: Instant) {
        if self.need_release_gate {
            self.need_release_gate = false;
            for ch in 0..CHANNEL_COUNT {
                let raw = self.io.is_pressed_raw(ch);
                let stream = self.stream_active;
                let st = self.channels.state_mut(ch);
                st.debounce.reseed(raw, now);
                if stream {
                    st.prev_pressed = raw;
                }
            }
        }

        let mut pressed = [false; CHANNEL_COUNT];
        for ch in 0..CHANNEL_COUNT {
            let raw = self.io.is_pressed_raw(ch);
            let (mut latch_event, mut press_event) = (false, None);
            {
                let st = self.channels.state_mut(ch);
                let (p, edge) = st.debounce.update(raw, now);
                pressed[ch] = p;
                if st.class == ChannelClass::Latch && edge {
                    st.latched = true;
                    st.ignored = true;
                    if !st.prev_latched {
                        st.prev_latched = true;
                        latch_event = true;
                    }
                }
                if st.tracked() && p != st.prev_pressed {
                    st.prev_pressed = p;
                    press_event = Some(p);
                }
            }
            if latch_event {
                self.send_event(EventKind::Latched, ch, true, now);
            }
            if let Some(p) = press_event {
                self.send_event(EventKind::Pressed, ch, p, now);
            }
        }

        let final_ready = self.channels.all_latch_latched();
        for ch in 0..CHANNEL_COUNT {
            let st = self.channels.state(ch);
            let led = if st.ignored {
                false
            } else {
                match st.class {
                    ChannelClass::Normal => !pressed[ch],
                    ChannelClass::Latch => !st.latched,
                    ChannelClass::Untracked => pressed[ch] && self.blink_on,
                }
            };
            self.io.set_led(ch, led);
        }

        if final_ready && self.channels.normals_held() && self.has_work(false) {
            let since = *self.live_ok_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= Duration::from_millis(AUTO_FINAL_HOLD_MS) {
                let frame = auto_final_frame(&self.mac);
                self.send_raw_to_peer(frame.as_str());
                log!(Level::Info, "auto-final after {} ms hold", AUTO_FINAL_HOLD_MS);
                self.send_success_and_idle(now);
            }
        } else {
            self.live_ok_since = None;
        }
    }

    // ---- final check ----

    /// One evaluating pass over all channels: refreshes debounce and latch
    /// state, streams deltas, applies the check LED policy, and records
    /// MISSING/EXTRA for this pass.
    pub(crate) fn check_all(&mut self, restrict: bool, now: Instant) -> bool {
        self.missing.clear();
        self.extra.clear();
        let mut ok = true;

        let mut pressed = [false; CHANNEL_COUNT];
        for ch in 0..CHANNEL_COUNT {
            let raw = self.io.is_pressed_raw(ch);
            let (mut latch_event, mut press_event) = (false, None);
            {
                let st = self.channels.state_mut(ch);
                let (p, edge) = st.debounce.update(raw, now);
                pressed[ch] = p;
                if st.class == ChannelClass::Latch && edge {
                    st.latched = true;
                    st.ignored = true;
                    if !st.prev_latched {
                        st.prev_latched = true;
                        latch_event = true;
                    }
                }
                if st.tracked() && p != st.prev_pressed {
                    st.prev_pressed = p;
                    press_event = Some(p);
                }
            }
            if latch_event {
                self.send_event(EventKind::Latched, ch, true, now);
            }
            if let Some(p) = press_event {
                self.send_event(EventKind::Pressed, ch, p, now);
            }
        }

        for ch in 0..CHANNEL_COUNT {
            let (class, latched, ignored) = {
                let st = self.channels.state(ch);
                (st.class, st.latched, st.ignored)
            };
            if ignored {
                self.io.set_led(ch, false);
                continue;
            }
            let selected = if restrict {
                self.check_active && self.check_select[ch]
            } else {
                class != ChannelClass::Untracked
            };
            match class {
                ChannelClass::Normal => {
                    if selected && !pressed[ch] {
                        ok = false;
                        self.missing.push_channel(ch + 1);
                    }
                    self.io.set_led(ch, !pressed[ch]);
                }
                ChannelClass::Latch => {
                    if selected && !latched {
                        ok = false;
                        self.missing.push_channel(ch + 1);
                    }
                    self.io.set_led(ch, !latched);
                }
                ChannelClass::Untracked => {
                    if pressed[ch] {
                        ok = false;
                        self.extra.push_channel(ch + 1);
                        self.io.set_led(ch, self.blink_on);
                    } else {
                        self.io.set_led(ch, false);
                    }
                }
            }
        }
        ok
    }

    pub(crate) fn trim_buffers(&mut self) {
        self.missing.trim();
        self.extra.trim();
    }

    /// Concludes the vote: success goes dark; failure reports and drops back
    /// to MONITORING with the session peer intact.
    pub(crate) fn finish_final_check(&mut self, passed: bool, now: Instant) {
        self.trim_buffers();
        if passed {
            log!(Level::Info, "final check: SUCCESS");
            self.send_success_and_idle(now);
        } else {
            log!(
                Level::Info,
                "final check: FAILURE missing=[{}] extra=[{}]",
                self.missing.as_str(),
                self.extra.as_str()
            );
            let frame = result_failure_frame(self.missing.as_str(), self.extra.as_str(), &self.mac);
            match self.peer.get() {
                Some(p) => {
                    self.reliable.send(frame.as_str(), p, now, &self.raw_tx);
                }
                None => log!(Level::Warn, "failure without session target"),
            }
            self.state = SessionState::Monitoring;
        }
    }

    fn mirror_baseline(&mut self) {
        for ch in 0..CHANNEL_COUNT {
            if !self.channels.state(ch).tracked() {
                continue;
            }
            let p = self.io.is_pressed_raw(ch);
            let st = self.channels.state_mut(ch);
            st.prev_pressed = p;
            st.prev_latched = st.latched;
        }
    }
}

/// Runs the sampled final-check vote. Samples are spaced so they are
/// independent of the debounce hold, and the reliable slot is serviced
/// between samples.
async fn run_final_check<B: ExpanderBus>(core: &mut HubCore<B>) {
    let restrict = core.check_active;
    if !core.has_work(restrict) {
        log!(Level::Info, "final check with nothing to evaluate: SUCCESS");
        core.send_success_and_idle(Instant::now());
        return;
    }
    // Streaming continues from MONITORING without a rebaseline.
    core.start_streaming(false);

    let mut vote = FinalVote::new();
    loop {
        let pass = core.check_all(restrict, Instant::now());
        match vote.record(pass) {
            VoteStep::Decided => break,
            VoteStep::Continue => {
                Timer::after(Duration::from_millis(SAMPLE_DELAY_MS)).await;
                core.service_reliable(Instant::now());
            }
        }
    }

    // One more evaluating pass so MISSING/EXTRA and the LEDs reflect the
    // final state, then a short yield so queued raw EVs leave before RESULT
    // claims the slot.
    let _ = core.check_all(restrict, Instant::now());
    Timer::after(Duration::from_millis(1)).await;
    core.finish_final_check(vote.passed(), Instant::now());
}

/// Executes one drained deferred action.
async fn run_deferred<B: ExpanderBus>(core: &mut HubCore<B>, work: DeferredWork) {
    match work.kind {
        DeferredKind::Blink(times) => {
            for _ in 0..times {
                core.io.all_leds(true);
                Timer::after(Duration::from_millis(120)).await;
                core.service_reliable(Instant::now());
                core.io.all_leds(false);
                Timer::after(Duration::from_millis(120)).await;
                core.service_reliable(Instant::now());
            }
        }
        DeferredKind::Chase(rounds) => {
            for _ in 0..rounds.max(1) {
                for ch in 0..CHANNEL_COUNT {
                    core.io.set_led(ch, true);
                    Timer::after(Duration::from_millis(40)).await;
                    core.service_reliable(Instant::now());
                    core.io.set_led(ch, false);
                    Timer::after(Duration::from_millis(1)).await;
                    core.service_reliable(Instant::now());
                }
            }
        }
        DeferredKind::MonitorBaseline => {
            core.start_streaming(true);
            let target = work.target.or_else(|| core.peer.get());
            let Some(target) = target else {
                log!(Level::Warn, "baseline snapshot without session peer");
                return;
            };
            core.send_raw(monitor_start_frame(&core.mac).as_str(), target);
            for ch in 0..CHANNEL_COUNT {
                let (tracked, is_latch, latched) = {
                    let st = core.channels.state(ch);
                    (st.tracked(), st.class == ChannelClass::Latch, st.latched)
                };
                if !tracked {
                    continue;
                }
                let p = core.io.is_pressed_raw(ch);
                core.send_raw(event_frame(EventKind::Pressed, ch, p, &core.mac).as_str(), target);
                // Pace the burst so the radio task can drain the queue.
                Timer::after(Duration::from_millis(1)).await;
                if is_latch {
                    core.send_raw(
                        event_frame(EventKind::Latched, ch, latched, &core.mac).as_str(),
                        target,
                    );
                    Timer::after(Duration::from_millis(1)).await;
                }
            }
            core.mirror_baseline();
        }
    }
}

#[cfg(feature = "expander-bus-simulator")]
use crate::expander_bus_simulator::FixtureBus;

#[cfg(feature = "expander-bus-simulator")]
#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 4))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn hub_main_task(
    bus: FixtureBus,
    mac: Mac,
    commands: HubCommandQueueReceiver,
    raw_tx: TxFrameQueueSender,
    peer: &'static PeerCell,
    reliable: &'static ReliableTx,
) -> ! {
    let io = IoMap::new(bus);
    let mut core = HubCore::new(io, mac, peer, reliable, raw_tx, Instant::now());
    log!(Level::Info, "hub main loop started ({})", mac);
    loop {
        while let Ok(command) = commands.try_receive() {
            core.dispatch(command, Instant::now());
        }
        core.tick(Instant::now());
        if core.take_final_check() {
            run_final_check(&mut core).await;
        }
        core.service_reliable(Instant::now());
        if let Some(work) = core.take_deferred() {
            run_deferred(&mut core, work).await;
        }
        Timer::after(Duration::from_millis(MAIN_LOOP_TICK_MS)).await;
    }
}

#[cfg(all(test, feature = "std", feature = "expander-bus-simulator"))]
mod tests {
    use super::*;
    use crate::expander_bus_simulator::SimFixture;
    use crate::TxFrameQueue;

    fn t(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn hub_mac() -> Mac {
        Mac([0x08, 0x3A, 0x8D, 0x15, 0x27, 0x54])
    }

    fn station() -> Mac {
        Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])
    }

    struct Harness {
        core: HubCore<FixtureBus>,
        fixture: &'static SimFixture,
        tx: &'static TxFrameQueue,
    }

    impl Harness {
        /// Hub past self-check with the station bound as session peer.
        fn ready() -> Harness {
            let fixture: &'static SimFixture = Box::leak(Box::new(SimFixture::new()));
            let tx: &'static TxFrameQueue = Box::leak(Box::new(TxFrameQueue::new()));
            let peer: &'static PeerCell = Box::leak(Box::new(PeerCell::new()));
            let reliable: &'static ReliableTx = Box::leak(Box::new(ReliableTx::new(1000)));
            let io = IoMap::new(FixtureBus::new(fixture));
            let mut core = HubCore::new(io, hub_mac(), peer, reliable, tx.sender(), t(0));
            core.tick(t(1));
            assert_eq!(core.state(), SessionState::WaitForTarget);
            peer.set(station());
            Harness { core, fixture, tx }
        }

        fn frames(&self) -> std::vec::Vec<std::string::String> {
            let mut out = std::vec::Vec::new();
            while let Ok(f) = self.tx.receiver().try_receive() {
                out.push(f.frame.text().unwrap().to_string());
            }
            out
        }

        fn monitor(&mut self, payload: &str, now: Instant) {
            self.core
                .dispatch(HubCommand::Monitor(RadioFrame::from_payload(payload)), now);
            // Tests drive ticks directly; drop the baseline snapshot job.
            let work = self.core.take_deferred().unwrap();
            assert_eq!(work.kind, DeferredKind::MonitorBaseline);
        }
    }

    #[test]
    fn self_check_waits_for_all_released() {
        let fixture: &'static SimFixture = Box::leak(Box::new(SimFixture::new()));
        let tx: &'static TxFrameQueue = Box::leak(Box::new(TxFrameQueue::new()));
        let peer: &'static PeerCell = Box::leak(Box::new(PeerCell::new()));
        let reliable: &'static ReliableTx = Box::leak(Box::new(ReliableTx::new(1000)));
        let io = IoMap::new(FixtureBus::new(fixture));
        fixture.press(12);
        let mut core = HubCore::new(io, hub_mac(), peer, reliable, tx.sender(), t(0));

        core.tick(t(1));
        assert_eq!(core.state(), SessionState::SelfCheck);
        // The stuck channel blinks while self-check holds.
        assert!(fixture.led(12));

        fixture.release(12);
        core.tick(t(10));
        assert_eq!(core.state(), SessionState::WaitForTarget);
    }

    #[test]
    fn welcome_replies_then_blinks_six_edges() {
        let mut h = Harness::ready();
        h.core.dispatch(HubCommand::Welcome, t(10));
        assert_eq!(h.core.state(), SessionState::Welcome);
        assert_eq!(h.frames(), ["WELCOME", "READY ID=1000"]);

        let mut now = 10;
        while h.core.state() == SessionState::Welcome {
            now += 10;
            assert!(now < 1000, "welcome never ended");
            h.core.tick(t(now));
        }
        assert_eq!(h.core.state(), SessionState::WaitForTarget);
        for ch in 0..CHANNEL_COUNT {
            assert!(!h.fixture.led(ch));
        }
    }

    #[test]
    fn monitor_lights_tracked_channels_and_replies() {
        let mut h = Harness::ready();
        h.monitor("MONITOR NORMAL 2 5,7 AA:BB:CC:DD:EE:01", t(20));
        assert_eq!(h.core.state(), SessionState::Monitoring);
        assert_eq!(h.frames(), ["MONITOR-OK ID=1000"]);
        assert!(h.fixture.led(4));
        assert!(h.fixture.led(6));
        assert!(!h.fixture.led(0));
        assert!(h.core.need_release_gate);
    }

    #[test]
    fn normal_channels_held_trigger_auto_final() {
        let mut h = Harness::ready();
        h.monitor("MONITOR NORMAL 2 5,7", t(20));
        h.frames();

        h.core.tick(t(30));
        h.fixture.press(4);
        h.fixture.press(6);
        h.core.tick(t(40));
        h.core.tick(t(70)); // debounce settles, hold timer starts
        assert_eq!(h.core.state(), SessionState::Monitoring);
        // Held normal channels go dark while the hold accrues.
        assert!(!h.fixture.led(4));

        h.core.tick(t(150));
        assert_eq!(h.core.state(), SessionState::Monitoring);
        h.core.tick(t(270)); // >= 200 ms after the predicate first held
        assert_eq!(h.core.state(), SessionState::WaitForTarget);
        assert_eq!(
            h.frames(),
            [
                "AUTO-FINAL 08:3A:8D:15:27:54",
                "RESULT SUCCESS 08:3A:8D:15:27:54 ID=1001"
            ]
        );
        assert!(h.core.peer.get().is_none());
        for ch in 0..CHANNEL_COUNT {
            assert!(!h.fixture.led(ch));
        }
    }

    #[test]
    fn releasing_a_normal_channel_restarts_the_hold() {
        let mut h = Harness::ready();
        h.monitor("MONITOR NORMAL 1 5", t(20));
        h.frames();
        h.core.tick(t(30));
        h.fixture.press(4);
        h.core.tick(t(40));
        h.core.tick(t(70));
        h.fixture.release(4);
        h.core.tick(t(100));
        h.core.tick(t(130)); // release debounced: hold aborted
        h.fixture.press(4);
        h.core.tick(t(140));
        h.core.tick(t(170));
        h.core.tick(t(300)); // only ~130 ms since the re-press settled
        assert_eq!(h.core.state(), SessionState::Monitoring);
        h.core.tick(t(380));
        assert_eq!(h.core.state(), SessionState::WaitForTarget);
    }

    #[test]
    fn latch_tap_latches_and_checks_out_clean() {
        let mut h = Harness::ready();
        h.monitor("MONITOR LATCH 1 3", t(20));
        h.frames();
        assert!(h.fixture.led(2));

        h.core.tick(t(30));
        h.fixture.press(2);
        h.core.tick(t(40));
        h.core.tick(t(70)); // tap accepted
        h.fixture.release(2);
        h.core.tick(t(80));
        h.core.tick(t(110));
        assert!(!h.fixture.led(2)); // latched channels go dark
        assert!(h.core.channels.state(2).latched);
        assert!(h.core.channels.state(2).ignored);

        // All tracked channels are ignored now: CHECK succeeds with no work.
        h.core
            .dispatch(HubCommand::Check(RadioFrame::from_payload("CHECK")), t(120));
        assert_eq!(h.core.state(), SessionState::WaitForTarget);
        assert_eq!(h.frames(), ["RESULT SUCCESS 08:3A:8D:15:27:54 ID=1001"]);
    }

    #[test]
    fn check_failure_reports_missing_and_extra() {
        let mut h = Harness::ready();
        h.monitor("MONITOR NORMAL 2 1,2", t(20));
        h.frames();
        h.core.tick(t(30));
        h.fixture.press(0); // required, held
        h.fixture.press(8); // untracked channel 9 pressed
        h.core.tick(t(40));
        h.core.tick(t(70));

        h.core
            .dispatch(HubCommand::Check(RadioFrame::from_payload("CHECK")), t(80));
        assert_eq!(h.core.state(), SessionState::FinalCheck);
        assert!(h.core.take_final_check());

        let mut vote = FinalVote::new();
        let mut now = 80;
        loop {
            let pass = h.core.check_all(false, t(now));
            assert!(!pass);
            now += SAMPLE_DELAY_MS;
            if vote.record(pass) == VoteStep::Decided {
                break;
            }
        }
        assert!(!vote.passed());
        let _ = h.core.check_all(false, t(now));
        h.core.finish_final_check(false, t(now));

        assert_eq!(h.core.state(), SessionState::Monitoring);
        assert_eq!(
            h.frames(),
            ["RESULT FAILURE MISSING 2;EXTRA 9 08:3A:8D:15:27:54 ID=1001"]
        );
        // The session continues: the peer is kept for the next attempt.
        assert_eq!(h.core.peer.get(), Some(station()));
        // The extra channel blinks, the missing one stays lit.
        assert!(h.fixture.led(1));
    }

    #[test]
    fn check_subset_skips_unselected_channels() {
        let mut h = Harness::ready();
        h.monitor("MONITOR NORMAL 3 1,2,3", t(20));
        h.frames();
        h.core.tick(t(30));
        h.fixture.press(0);
        h.core.tick(t(40));
        h.core.tick(t(70));

        h.core.dispatch(
            HubCommand::Check(RadioFrame::from_payload("CHECK 1,3 AA:BB:CC:DD:EE:01")),
            t(80),
        );
        assert!(h.core.take_final_check());
        let pass = h.core.check_all(true, t(90));
        assert!(!pass);
        h.core.finish_final_check(false, t(90));
        assert_eq!(
            h.frames(),
            ["RESULT FAILURE MISSING 3 08:3A:8D:15:27:54 ID=1001"]
        );
    }

    #[test]
    fn check_outside_monitoring_is_ignored() {
        let mut h = Harness::ready();
        h.core
            .dispatch(HubCommand::Check(RadioFrame::from_payload("CHECK 1")), t(10));
        assert_eq!(h.core.state(), SessionState::WaitForTarget);
        assert!(h.frames().is_empty());
    }

    #[test]
    fn clean_resets_everything_and_confirms_raw() {
        let mut h = Harness::ready();
        h.monitor("MONITOR LATCH 1 3", t(20));
        h.frames();
        h.core.tick(t(30));
        h.fixture.press(2);
        h.core.tick(t(40));
        h.core.tick(t(70));
        assert!(h.core.channels.state(2).latched);

        h.core.dispatch(HubCommand::Clean, t(100));
        assert_eq!(h.core.state(), SessionState::WaitForTarget);
        assert_eq!(h.frames(), ["CLEAN-OK"]);
        assert!(h.core.peer.get().is_none());
        assert!(!h.core.channels.state(2).latched);
        assert_eq!(h.core.channels.state(2).class, ChannelClass::Untracked);
        for ch in 0..CHANNEL_COUNT {
            assert!(!h.fixture.led(ch));
        }
    }

    #[test]
    fn deferred_slot_keeps_only_the_newest_request() {
        let mut h = Harness::ready();
        h.core.dispatch(HubCommand::Blink(2), t(10));
        h.core.dispatch(HubCommand::Chase(1), t(20));
        let work = h.core.take_deferred().unwrap();
        assert_eq!(work.kind, DeferredKind::Chase(1));
        assert_eq!(work.target, Some(station()));
        assert!(h.core.take_deferred().is_none());
        assert_eq!(h.frames(), ["BLINK-OK ID=1000", "CHASE-OK ID=1001"]);
    }

    #[test]
    fn event_throttle_drops_inside_the_gap() {
        let mut h = Harness::ready();
        h.monitor("MONITOR NORMAL 1 5", t(20));
        h.frames();
        h.core.start_streaming(true);

        h.core.send_event(EventKind::Pressed, 4, true, t(30));
        h.core.send_event(EventKind::Pressed, 4, false, t(35)); // inside the 10 ms gap
        h.core.send_event(EventKind::Pressed, 4, false, t(45));
        // Different kind has its own gate.
        h.core.send_event(EventKind::Latched, 4, true, t(36));
        assert_eq!(
            h.frames(),
            [
                "EV P 5 1 08:3A:8D:15:27:54",
                "EV P 5 0 08:3A:8D:15:27:54",
                "EV L 5 1 08:3A:8D:15:27:54"
            ]
        );
    }

    #[test]
    fn monitoring_streams_press_and_latch_events() {
        let mut h = Harness::ready();
        h.monitor("MONITOR LATCH 1 3", t(20));
        h.frames();
        h.core.start_streaming(true);
        h.core.tick(t(30));
        h.fixture.press(2);
        h.core.tick(t(40));
        h.core.tick(t(70));
        let frames = h.frames();
        assert!(frames.contains(&"EV L 3 1 08:3A:8D:15:27:54".to_string()));
        assert!(frames.contains(&"EV P 3 1 08:3A:8D:15:27:54".to_string()));
    }

    #[test]
    fn reclassifying_monitor_clears_latch_memory() {
        let mut h = Harness::ready();
        h.monitor("MONITOR LATCH 1 3", t(20));
        h.core.tick(t(30));
        h.fixture.press(2);
        h.core.tick(t(40));
        h.core.tick(t(70));
        h.fixture.release(2);
        assert!(h.core.channels.state(2).latched);

        h.monitor("MONITOR NORMAL 1 3", t(100));
        assert!(!h.core.channels.state(2).latched);
        assert!(!h.core.channels.state(2).ignored);
        assert_eq!(h.core.channels.state(2).class, ChannelClass::Normal);
        // Entering MONITOR while already monitoring keeps the release gate off.
        assert!(!h.core.need_release_gate);
    }

    #[test]
    fn strict_vote_decides_early_both_ways() {
        let mut vote = FinalVote::new();
        assert_eq!(vote.record(false), VoteStep::Decided);
        assert!(!vote.passed());

        let mut vote = FinalVote::new();
        for _ in 0..4 {
            assert_eq!(vote.record(true), VoteStep::Continue);
        }
        assert_eq!(vote.record(true), VoteStep::Decided);
        assert!(vote.passed());
    }

    #[test]
    fn hello_forgets_the_peer_and_broadcasts() {
        let mut h = Harness::ready();
        h.core.dispatch(HubCommand::Hello, t(10));
        assert!(h.core.peer.get().is_none());
        let out = h.tx.receiver().try_receive().unwrap();
        assert_eq!(out.dest, Mac::BROADCAST);
        assert_eq!(out.frame.text().unwrap(), "HELLO");
    }

    #[test]
    fn reliable_service_is_inert_during_self_check() {
        let fixture: &'static SimFixture = Box::leak(Box::new(SimFixture::new()));
        let tx: &'static TxFrameQueue = Box::leak(Box::new(TxFrameQueue::new()));
        let peer: &'static PeerCell = Box::leak(Box::new(PeerCell::new()));
        let reliable: &'static ReliableTx = Box::leak(Box::new(ReliableTx::new(1)));
        let io = IoMap::new(FixtureBus::new(fixture));
        // Never ticked: the core stays in SELF_CHECK.
        let core = HubCore::new(io, hub_mac(), peer, reliable, tx.sender(), t(0));

        reliable.send("READY", station(), t(0), &tx.sender());
        core.service_reliable(t(500));
        assert!(!reliable.is_active());
    }
}
