//! Host simulation of one hub and one station on a shared medium.
//!
//! Scripts a full operator session: WELCOME, a MONITOR with two normal
//! channels, switch presses that auto-finalize, then a deliberate failure
//! with an extra pressed channel. Station console output goes to stdout.

use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use env_logger::Builder;
use log::LevelFilter;

use fixture_link::{
    FixtureBus, HubNode, LinkConfig, Mac, RadioDevice, RadioMedium, SimFixture, StationNode,
};

const HUB_MAC: Mac = Mac([0x08, 0x3A, 0x8D, 0x15, 0x27, 0x54]);
const STATION_MAC: Mac = Mac([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);

#[embassy_executor::task]
async fn operator_script(station: &'static StationNode, fixture: &'static SimFixture) {
    let hub = "08:3A:8D:15:27:54";

    Timer::after(Duration::from_millis(200)).await;
    println!("--- WELCOME ---");
    let _ = station.submit_line(&format!("WELCOME {hub}"));
    Timer::after(Duration::from_millis(1500)).await;

    println!("--- MONITOR two normal channels, operator holds both ---");
    let _ = station.submit_line(&format!("MONITOR NORMAL 2 5,7 {hub}"));
    Timer::after(Duration::from_millis(500)).await;
    fixture.press(4);
    fixture.press(6);
    // Auto-final fires after the 200 ms hold.
    Timer::after(Duration::from_millis(1500)).await;
    fixture.release(4);
    fixture.release(6);

    println!("--- MONITOR again, one channel missing plus an extra press ---");
    let _ = station.submit_line(&format!("MONITOR NORMAL 2 5,7 {hub}"));
    Timer::after(Duration::from_millis(500)).await;
    fixture.press(4);
    fixture.press(8);
    Timer::after(Duration::from_millis(500)).await;
    let _ = station.submit_line(&format!("CHECK 5,7 {hub}"));
    Timer::after(Duration::from_millis(1500)).await;

    println!("--- CLEAN ---");
    fixture.release(4);
    fixture.release(8);
    let _ = station.submit_line(&format!("CLEAN {hub}"));
    Timer::after(Duration::from_millis(500)).await;
    println!("--- script done ---");
    std::process::exit(0);
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    Builder::new().filter_level(LevelFilter::Info).init();

    let medium: &'static RadioMedium = Box::leak(Box::new(RadioMedium::new()));
    let fixture: &'static SimFixture = Box::leak(Box::new(SimFixture::new()));

    let mut hub = HubNode::new();
    hub.initialize(
        LinkConfig { channel: 1 },
        spawner,
        RadioDevice::new(medium, HUB_MAC),
        FixtureBus::new(fixture),
        HUB_MAC,
    )
    .expect("hub init");

    let mut station = StationNode::new();
    station
        .initialize(
            LinkConfig { channel: 1 },
            spawner,
            RadioDevice::new(medium, STATION_MAC),
        )
        .expect("station init");
    let station: &'static StationNode = Box::leak(Box::new(station));

    spawner.spawn(operator_script(station, fixture)).unwrap();

    loop {
        if let Ok(line) = station.next_console_line().await {
            println!("station> {}", line.as_str());
        }
    }
}
