//! # Radio Device Simulator - Testing and Development Mock
//!
//! Connectionless radio emulation for running hubs and stations on a host
//! without hardware. A shared [`RadioMedium`] routes frames by MAC: unicast
//! frames reach the one attached node with the matching address, broadcast
//! frames fan out to every node except the sender. Delivery is immediate and
//! lossy under backpressure, which matches the real link's best-effort
//! semantics: a full receive queue drops the frame.
//!
//! The device task has the same contract as a hardware radio device: it
//! drains the node's TX frame queue into the medium and feeds received frames
//! into the node's RX frame queue.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use log::{log, Level};

use crate::wire::Mac;
use crate::{RadioFrame, ReceivedFrame, RxFrameQueueSender, TxFrameQueueReceiver};

/// Maximum nodes attached to one simulated medium.
const MAX_SIM_NODES: usize = 8;

/// Shared routing fabric connecting simulated nodes.
pub struct RadioMedium {
    nodes: Mutex<
        CriticalSectionRawMutex,
        RefCell<heapless::Vec<(Mac, RxFrameQueueSender), MAX_SIM_NODES>>,
    >,
}

impl RadioMedium {
    pub const fn new() -> Self {
        RadioMedium {
            nodes: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    fn attach(&self, mac: Mac, sender: RxFrameQueueSender) {
        self.nodes.lock(|nodes| {
            let mut nodes = nodes.borrow_mut();
            if nodes.iter().any(|(m, _)| *m == mac) {
                log!(Level::Warn, "node {} already attached to medium", mac);
                return;
            }
            if nodes.push((mac, sender)).is_err() {
                log!(Level::Error, "simulated medium full, {} not attached", mac);
            }
        });
    }

    /// Routes one frame. Unroutable unicasts vanish, like on the real air.
    pub fn deliver(&self, src: Mac, dest: Mac, frame: &RadioFrame) {
        self.nodes.lock(|nodes| {
            let nodes = nodes.borrow();
            for (mac, sender) in nodes.iter() {
                let hit = if dest.is_broadcast() {
                    *mac != src
                } else {
                    *mac == dest
                };
                if !hit {
                    continue;
                }
                let received = ReceivedFrame {
                    src,
                    frame: frame.clone(),
                };
                if sender.try_send(received).is_err() {
                    log!(Level::Warn, "RX queue full at {}, dropping frame", mac);
                }
            }
        });
    }
}

/// Simulated radio bound to one medium under one address.
pub struct RadioDevice {
    medium: &'static RadioMedium,
    mac: Mac,
}

impl RadioDevice {
    pub const fn new(medium: &'static RadioMedium, mac: Mac) -> Self {
        RadioDevice { medium, mac }
    }
}

#[cfg_attr(feature = "std", embassy_executor::task(pool_size = 8))]
#[cfg_attr(feature = "embedded", embassy_executor::task(pool_size = 1))]
pub(crate) async fn radio_device_task(
    radio_device: RadioDevice,
    tx_receiver: TxFrameQueueReceiver,
    rx_sender: RxFrameQueueSender,
) -> ! {
    radio_device.medium.attach(radio_device.mac, rx_sender);
    log!(Level::Debug, "simulated radio attached as {}", radio_device.mac);
    loop {
        let out = tx_receiver.receive().await;
        radio_device
            .medium
            .deliver(radio_device.mac, out.dest, &out.frame);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::RxFrameQueue;

    fn mac(last: u8) -> Mac {
        Mac([2, 4, 6, 8, 10, last])
    }

    #[test]
    fn unicast_reaches_only_the_addressee() {
        let medium: &'static RadioMedium = Box::leak(Box::new(RadioMedium::new()));
        let a: &'static RxFrameQueue = Box::leak(Box::new(RxFrameQueue::new()));
        let b: &'static RxFrameQueue = Box::leak(Box::new(RxFrameQueue::new()));
        medium.attach(mac(1), a.sender());
        medium.attach(mac(2), b.sender());

        medium.deliver(mac(1), mac(2), &RadioFrame::from_payload("PING"));
        assert!(a.receiver().try_receive().is_err());
        let got = b.receiver().try_receive().unwrap();
        assert_eq!(got.src, mac(1));
        assert_eq!(got.frame.text().unwrap(), "PING");
    }

    #[test]
    fn broadcast_fans_out_to_everyone_else() {
        let medium: &'static RadioMedium = Box::leak(Box::new(RadioMedium::new()));
        let a: &'static RxFrameQueue = Box::leak(Box::new(RxFrameQueue::new()));
        let b: &'static RxFrameQueue = Box::leak(Box::new(RxFrameQueue::new()));
        let c: &'static RxFrameQueue = Box::leak(Box::new(RxFrameQueue::new()));
        medium.attach(mac(1), a.sender());
        medium.attach(mac(2), b.sender());
        medium.attach(mac(3), c.sender());

        medium.deliver(mac(1), Mac::BROADCAST, &RadioFrame::from_payload("HELLO"));
        assert!(a.receiver().try_receive().is_err());
        assert_eq!(
            b.receiver().try_receive().unwrap().frame.text().unwrap(),
            "HELLO"
        );
        assert_eq!(
            c.receiver().try_receive().unwrap().frame.text().unwrap(),
            "HELLO"
        );
    }
}
