#![cfg_attr(not(feature = "std"), no_std)]

//! # fixture-link
//!
//! Firmware core for a two-node wireless test fixture: a **Hub** drives 40
//! LED/switch channels through five 16-bit port expanders and runs the test
//! session, a **Station** bridges a host console to one or more hubs over a
//! connectionless radio link on a fixed channel. A reliable unicast layer
//! (sequence IDs, auto-ACK, bounded linear-backoff retry) sits on top of the
//! raw link for state-bearing frames; live telemetry stays fire-and-forget.
//!
//! Radio and expander hardware are feature-selected concrete device types so
//! the whole system runs on a host simulator; real drivers plug in by
//! providing the same device-task contract.

#[cfg(all(not(test), not(any(feature = "radio-device-simulator"))))]
compile_error!("At least one radio device implementation feature must be enabled");

pub mod channel_model;
pub mod debounce;
mod hub;
mod hub_rx;
pub mod io_map;
pub mod reliable_tx;
mod station;
pub mod wire;

#[cfg(feature = "expander-bus-simulator")]
pub mod expander_bus_simulator;

#[cfg(feature = "radio-device-simulator")]
pub mod radio_device_simulator;

#[cfg(feature = "radio-device-simulator")]
use crate::radio_device_simulator::radio_device_task;

#[cfg(feature = "radio-device-simulator")]
pub use crate::radio_device_simulator::{RadioDevice, RadioMedium};

#[cfg(feature = "expander-bus-simulator")]
pub use crate::expander_bus_simulator::{FixtureBus, SimFixture};

pub use crate::wire::Mac;

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::channel::Channel;

use crate::reliable_tx::ReliableTx;

// Hardware-dependent constants that define link compatibility.
pub const CHANNEL_COUNT: usize = 40;
pub const EXPANDER_COUNT: usize = 5;
pub const RADIO_MTU: usize = 250;
/// Payload cap leaving room for ` ID=` framing inside the MTU.
pub const MAX_PAYLOAD_LEN: usize = 220;
pub const FRAMED_MAX_LEN: usize = MAX_PAYLOAD_LEN + 16;

// Session timing.
pub(crate) const MAIN_LOOP_TICK_MS: u64 = 10;
pub(crate) const BLINK_INTERVAL_MS: u64 = 100;
pub const CH_DEBOUNCE_MS: u64 = 25;
pub(crate) const MIN_EVENT_GAP_MS: u64 = 10;
pub(crate) const AUTO_FINAL_HOLD_MS: u64 = 200;
pub(crate) const WELCOME_BLINK_EDGES: u8 = 6;

// Final-check vote. 5 x 50 ms, strict by default; the `majority-vote`
// feature flips the threshold to 3-of-5.
pub(crate) const FINAL_CHECK_SAMPLES: u8 = 5;
pub(crate) const SAMPLE_DELAY_MS: u64 = 50;
#[cfg(feature = "majority-vote")]
pub(crate) const PASS_THRESHOLD: u8 = FINAL_CHECK_SAMPLES / 2 + 1;
#[cfg(not(feature = "majority-vote"))]
pub(crate) const PASS_THRESHOLD: u8 = FINAL_CHECK_SAMPLES;
const _: () = assert!(
    SAMPLE_DELAY_MS >= CH_DEBOUNCE_MS,
    "vote samples must be independent of the debounce hold"
);

/// FAILURE report list cap; overflow truncates silently.
pub(crate) const CSV_BUF_CAP: usize = 128;

const HUB_FIRST_SEQ_ID: u32 = 1000;

/// Raw bytes of one frame on the air, NUL-terminated within the MTU.
#[derive(Clone)]
pub struct RadioFrame {
    pub data: [u8; RADIO_MTU],
    pub len: usize,
}

impl RadioFrame {
    pub const fn empty() -> Self {
        RadioFrame {
            data: [0; RADIO_MTU],
            len: 0,
        }
    }

    pub fn from_payload(payload: &str) -> Self {
        let mut data = [0u8; RADIO_MTU];
        let n = core::cmp::min(payload.len(), RADIO_MTU - 1);
        data[..n].copy_from_slice(&payload.as_bytes()[..n]);
        // Trailing NUL goes on the air with the frame.
        RadioFrame { data, len: n + 1 }
    }

    /// Decoded payload with the NUL terminator and surrounding whitespace
    /// stripped. `None` for non-ASCII garbage.
    pub fn text(&self) -> Option<&str> {
        let mut bytes = &self.data[..self.len.min(RADIO_MTU)];
        if let Some(pos) = bytes.iter().position(|&b| b == 0) {
            bytes = &bytes[..pos];
        }
        let s = core::str::from_utf8(bytes).ok()?;
        Some(s.trim_matches(|c: char| c == ' ' || c == '\t' || c == '\r' || c == '\n'))
    }
}

pub struct ReceivedFrame {
    pub src: Mac,
    pub frame: RadioFrame,
}

pub struct OutboundFrame {
    pub dest: Mac,
    pub frame: RadioFrame,
}

/// Most recent non-zero peer address, shared between the RX context and the
/// main loop under a short critical section.
pub struct PeerCell(BlockingMutex<CriticalSectionRawMutex, Cell<Option<Mac>>>);

impl PeerCell {
    pub const fn new() -> Self {
        PeerCell(BlockingMutex::new(Cell::new(None)))
    }

    pub fn set(&self, mac: Mac) {
        self.0.lock(|c| c.set(Some(mac)));
    }

    pub fn get(&self) -> Option<Mac> {
        self.0.lock(|c| c.get())
    }

    pub fn clear(&self) {
        self.0.lock(|c| c.set(None));
    }
}

/// Radio link parameters shared by both node roles.
pub struct LinkConfig {
    /// Fixed radio channel, 1..=13.
    pub channel: u8,
}

impl LinkConfig {
    pub fn is_valid(&self) -> bool {
        (1..=13).contains(&self.channel)
    }
}

pub const CONSOLE_LINE_MAX_LEN: usize = 256;
/// One operator console line, either direction.
pub type ConsoleLine = heapless::String<CONSOLE_LINE_MAX_LEN>;

const TX_FRAME_QUEUE_SIZE: usize = 16;
pub(crate) type TxFrameQueue = Channel<CriticalSectionRawMutex, OutboundFrame, TX_FRAME_QUEUE_SIZE>;
pub(crate) type TxFrameQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, OutboundFrame, TX_FRAME_QUEUE_SIZE>;
pub(crate) type TxFrameQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, OutboundFrame, TX_FRAME_QUEUE_SIZE>;

const RX_FRAME_QUEUE_SIZE: usize = 16;
pub(crate) type RxFrameQueue = Channel<CriticalSectionRawMutex, ReceivedFrame, RX_FRAME_QUEUE_SIZE>;
pub(crate) type RxFrameQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, RX_FRAME_QUEUE_SIZE>;
pub(crate) type RxFrameQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, RX_FRAME_QUEUE_SIZE>;

const HUB_COMMAND_QUEUE_SIZE: usize = 8;
pub(crate) type HubCommandQueue =
    Channel<CriticalSectionRawMutex, hub::HubCommand, HUB_COMMAND_QUEUE_SIZE>;
pub(crate) type HubCommandQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, hub::HubCommand, HUB_COMMAND_QUEUE_SIZE>;
pub(crate) type HubCommandQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, hub::HubCommand, HUB_COMMAND_QUEUE_SIZE>;

const CONSOLE_LINE_QUEUE_SIZE: usize = 4;
pub(crate) type ConsoleLineQueue =
    Channel<CriticalSectionRawMutex, ConsoleLine, CONSOLE_LINE_QUEUE_SIZE>;
pub(crate) type ConsoleLineQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ConsoleLine, CONSOLE_LINE_QUEUE_SIZE>;
pub(crate) type ConsoleLineQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ConsoleLine, CONSOLE_LINE_QUEUE_SIZE>;

const CONSOLE_OUT_QUEUE_SIZE: usize = 16;
pub(crate) type ConsoleOutQueue =
    Channel<CriticalSectionRawMutex, ConsoleLine, CONSOLE_OUT_QUEUE_SIZE>;
pub(crate) type ConsoleOutQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ConsoleLine, CONSOLE_OUT_QUEUE_SIZE>;
pub(crate) type ConsoleOutQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ConsoleLine, CONSOLE_OUT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static HUB_TX_FRAME_QUEUE: TxFrameQueue = Channel::new();
#[cfg(feature = "embedded")]
static HUB_RX_FRAME_QUEUE: RxFrameQueue = Channel::new();
#[cfg(feature = "embedded")]
static HUB_COMMAND_QUEUE: HubCommandQueue = Channel::new();
#[cfg(feature = "embedded")]
static HUB_SESSION_PEER: PeerCell = PeerCell::new();
#[cfg(feature = "embedded")]
static HUB_RELIABLE_TX: ReliableTx = ReliableTx::new(HUB_FIRST_SEQ_ID);

#[cfg(feature = "embedded")]
static STA_TX_FRAME_QUEUE: TxFrameQueue = Channel::new();
#[cfg(feature = "embedded")]
static STA_RX_FRAME_QUEUE: RxFrameQueue = Channel::new();
#[cfg(feature = "embedded")]
static STA_CONSOLE_LINE_QUEUE: ConsoleLineQueue = Channel::new();
#[cfg(feature = "embedded")]
static STA_CONSOLE_OUT_QUEUE: ConsoleOutQueue = Channel::new();
#[cfg(feature = "embedded")]
static STA_SHARED: station::StationShared = station::StationShared::new();

pub enum CommandError {
    NotInited,
    QueueFull,
}

pub enum SubmitLineError {
    NotInited,
    QueueFull,
    LineTooLong,
}

pub enum ConsoleError {
    NotInited,
}

enum HubNodeState {
    Uninitialized,
    Initialized {
        command_sender: HubCommandQueueSender,
    },
}

/// Hub facade: spawns the radio device, the RX dispatcher, and the main-loop
/// tasks, then hands out the local control surface.
pub struct HubNode {
    state: HubNodeState,
}

impl HubNode {
    pub const fn new() -> Self {
        HubNode {
            state: HubNodeState::Uninitialized,
        }
    }

    /// Local HELLO key was pressed: forget the session peer and broadcast
    /// HELLO. The key's debounce lives with the integrator.
    pub fn trigger_hello(&self) -> Result<(), CommandError> {
        match &self.state {
            HubNodeState::Uninitialized => Err(CommandError::NotInited),
            HubNodeState::Initialized { command_sender } => command_sender
                .try_send(hub::HubCommand::Hello)
                .map_err(|_| CommandError::QueueFull),
        }
    }
}

#[cfg(all(feature = "radio-device-simulator", feature = "expander-bus-simulator"))]
impl HubNode {
    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        config: LinkConfig,
        spawner: embassy_executor::Spawner,
        radio_device: RadioDevice,
        bus: FixtureBus,
        mac: Mac,
    ) -> Result<(), ()> {
        self.initialize_common(
            config,
            spawner,
            radio_device,
            bus,
            mac,
            &HUB_TX_FRAME_QUEUE,
            &HUB_RX_FRAME_QUEUE,
            &HUB_COMMAND_QUEUE,
            &HUB_SESSION_PEER,
            &HUB_RELIABLE_TX,
        )
    }

    #[cfg(feature = "std")]
    pub fn initialize(
        &mut self,
        config: LinkConfig,
        spawner: embassy_executor::Spawner,
        radio_device: RadioDevice,
        bus: FixtureBus,
        mac: Mac,
    ) -> Result<(), ()> {
        let tx_queue: &'static TxFrameQueue = Box::leak(Box::new(Channel::new()));
        let rx_queue: &'static RxFrameQueue = Box::leak(Box::new(Channel::new()));
        let command_queue: &'static HubCommandQueue = Box::leak(Box::new(Channel::new()));
        let peer: &'static PeerCell = Box::leak(Box::new(PeerCell::new()));
        let reliable: &'static ReliableTx = Box::leak(Box::new(ReliableTx::new(HUB_FIRST_SEQ_ID)));
        self.initialize_common(
            config, spawner, radio_device, bus, mac, tx_queue, rx_queue, command_queue, peer,
            reliable,
        )
    }

    #[cfg(any(feature = "embedded", feature = "std"))]
    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        config: LinkConfig,
        spawner: embassy_executor::Spawner,
        radio_device: RadioDevice,
        bus: FixtureBus,
        mac: Mac,
        tx_queue: &'static TxFrameQueue,
        rx_queue: &'static RxFrameQueue,
        command_queue: &'static HubCommandQueue,
        peer: &'static PeerCell,
        reliable: &'static ReliableTx,
    ) -> Result<(), ()> {
        if !config.is_valid() {
            log::log!(log::Level::Error, "bad radio channel {}", config.channel);
            return Err(());
        }
        if spawner
            .spawn(radio_device_task(
                radio_device,
                tx_queue.receiver(),
                rx_queue.sender(),
            ))
            .is_err()
        {
            return Err(());
        }
        let dispatcher = hub_rx::HubRx {
            peer,
            reliable,
            raw_tx: tx_queue.sender(),
            commands: command_queue.sender(),
        };
        if spawner
            .spawn(hub_rx::hub_rx_task(rx_queue.receiver(), dispatcher))
            .is_err()
        {
            return Err(());
        }
        if spawner
            .spawn(hub::hub_main_task(
                bus,
                mac,
                command_queue.receiver(),
                tx_queue.sender(),
                peer,
                reliable,
            ))
            .is_err()
        {
            return Err(());
        }
        self.state = HubNodeState::Initialized {
            command_sender: command_queue.sender(),
        };
        log::log!(log::Level::Info, "hub node initialized ({})", mac);
        Ok(())
    }
}

enum StationNodeState {
    Uninitialized,
    Initialized {
        line_sender: ConsoleLineQueueSender,
        console_receiver: ConsoleOutQueueReceiver,
    },
}

/// Station facade: console lines in, forwarded frames and replies out.
pub struct StationNode {
    state: StationNodeState,
}

impl StationNode {
    pub const fn new() -> Self {
        StationNode {
            state: StationNodeState::Uninitialized,
        }
    }

    /// Feeds one operator line into the console loop.
    pub fn submit_line(&self, line: &str) -> Result<(), SubmitLineError> {
        let StationNodeState::Initialized { line_sender, .. } = &self.state else {
            return Err(SubmitLineError::NotInited);
        };
        let mut owned = ConsoleLine::new();
        owned
            .push_str(line)
            .map_err(|_| SubmitLineError::LineTooLong)?;
        line_sender
            .try_send(owned)
            .map_err(|_| SubmitLineError::QueueFull)
    }

    /// Next console output line (forwarded EV/UI frames, replies, errors).
    pub async fn next_console_line(&self) -> Result<ConsoleLine, ConsoleError> {
        let StationNodeState::Initialized {
            console_receiver, ..
        } = &self.state
        else {
            return Err(ConsoleError::NotInited);
        };
        Ok(console_receiver.receive().await)
    }
}

#[cfg(feature = "radio-device-simulator")]
impl StationNode {
    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        config: LinkConfig,
        spawner: embassy_executor::Spawner,
        radio_device: RadioDevice,
    ) -> Result<(), ()> {
        self.initialize_common(
            config,
            spawner,
            radio_device,
            &STA_TX_FRAME_QUEUE,
            &STA_RX_FRAME_QUEUE,
            &STA_CONSOLE_LINE_QUEUE,
            &STA_CONSOLE_OUT_QUEUE,
            &STA_SHARED,
        )
    }

    #[cfg(feature = "std")]
    pub fn initialize(
        &mut self,
        config: LinkConfig,
        spawner: embassy_executor::Spawner,
        radio_device: RadioDevice,
    ) -> Result<(), ()> {
        let tx_queue: &'static TxFrameQueue = Box::leak(Box::new(Channel::new()));
        let rx_queue: &'static RxFrameQueue = Box::leak(Box::new(Channel::new()));
        let line_queue: &'static ConsoleLineQueue = Box::leak(Box::new(Channel::new()));
        let out_queue: &'static ConsoleOutQueue = Box::leak(Box::new(Channel::new()));
        let shared: &'static station::StationShared =
            Box::leak(Box::new(station::StationShared::new()));
        self.initialize_common(
            config,
            spawner,
            radio_device,
            tx_queue,
            rx_queue,
            line_queue,
            out_queue,
            shared,
        )
    }

    #[cfg(any(feature = "embedded", feature = "std"))]
    #[allow(clippy::too_many_arguments)]
    fn initialize_common(
        &mut self,
        config: LinkConfig,
        spawner: embassy_executor::Spawner,
        radio_device: RadioDevice,
        tx_queue: &'static TxFrameQueue,
        rx_queue: &'static RxFrameQueue,
        line_queue: &'static ConsoleLineQueue,
        out_queue: &'static ConsoleOutQueue,
        shared: &'static station::StationShared,
    ) -> Result<(), ()> {
        if !config.is_valid() {
            log::log!(log::Level::Error, "bad radio channel {}", config.channel);
            return Err(());
        }
        if spawner
            .spawn(radio_device_task(
                radio_device,
                tx_queue.receiver(),
                rx_queue.sender(),
            ))
            .is_err()
        {
            return Err(());
        }
        let dispatcher = station::StationRx {
            shared,
            console: out_queue.sender(),
            raw_tx: tx_queue.sender(),
        };
        if spawner
            .spawn(station::station_rx_task(rx_queue.receiver(), dispatcher))
            .is_err()
        {
            return Err(());
        }
        if spawner
            .spawn(station::station_main_task(
                line_queue.receiver(),
                out_queue.sender(),
                tx_queue.sender(),
                shared,
            ))
            .is_err()
        {
            return Err(());
        }
        self.state = StationNodeState::Initialized {
            line_sender: line_queue.sender(),
            console_receiver: out_queue.receiver(),
        };
        log::log!(log::Level::Info, "station node initialized");
        Ok(())
    }
}
