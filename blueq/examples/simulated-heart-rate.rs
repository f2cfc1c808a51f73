//! Talks to an in-memory heart rate monitor through a gateway
//!
//! Run with `RUST_LOG=blueq=debug` to watch requests queue up and run.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use uuid::Uuid;

use blueq::fake::{FakePeripheral, FakeProvider};
use blueq::uuid::uuid_from_u16;
use blueq::{Address, CharacteristicProperties, Gateway, SessionConfig, TokioContext};

const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_builder().filter_level(log::LevelFilter::Info)
                                          .parse_default_env()
                                          .init();

    let address: Address = "C0:FF:EE:C0:FF:EE".parse()?;
    let monitor = FakePeripheral::new()
        .with_characteristic(BATTERY_LEVEL, CharacteristicProperties::READ, &[93])
        .with_characteristic(HEART_RATE_MEASUREMENT, CharacteristicProperties::NOTIFY, &[]);
    let provider = Arc::new(FakeProvider::new());
    provider.add(address.clone(), monitor.clone());

    let gateway = Gateway::new(provider, Arc::new(TokioContext::current()), SessionConfig::default())?;
    let session = gateway.session(&address)?;
    session.set_disconnect_callback(|state| warn!("Monitor went away ({})", state));

    let state = session.connect().await?;
    info!("{}: {}", session.address(), state);

    let battery = session.char_read(BATTERY_LEVEL).await?;
    match battery.first() {
        Some(level) => info!("Battery level: {}%", level),
        None => warn!("Battery level came back empty"),
    }

    session.subscribe(HEART_RATE_MEASUREMENT, |_, value| {
        // Flags byte first, then an 8 bit measurement
        if let Some(bpm) = value.get(1) {
            info!("Heart rate: {} bpm", bpm);
        }
    }).await?;

    for bpm in [72u8, 75, 79, 77, 74] {
        monitor.notify(HEART_RATE_MEASUREMENT, &[0x00, bpm]);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    monitor.drop_connection();
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("{}: {}", session.address(), session.state());

    gateway.shutdown();
    Ok(())
}
