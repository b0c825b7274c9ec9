// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ble_bridge::{
    sim::{SimulatedBackend, SimulatedCharacteristic, SimulatedPeripheral, SimulatedService},
    BleUuid, BluetoothError, CharacteristicProperties, Role, Session, SessionConfig,
    SessionEvent, SubscriptionMode,
};
use futures::stream::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

const HEART_RATE: BleUuid = BleUuid::from_u16(0x180D);
const MEASUREMENT: BleUuid = BleUuid::from_u16(0x2A37);
const BODY_SENSOR_LOCATION: BleUuid = BleUuid::from_u16(0x2A38);

fn heart_rate_monitor() -> SimulatedPeripheral {
    SimulatedPeripheral::new("hrm-01")
        .with_name("Pulse")
        .with_rssi(-48)
        .advertising(vec![HEART_RATE])
        .with_mtu(185)
        .with_service(
            SimulatedService::new(HEART_RATE)
                .with_characteristic(
                    SimulatedCharacteristic::new(MEASUREMENT, CharacteristicProperties::NOTIFY)
                        .with_cccd(),
                )
                .with_characteristic(
                    SimulatedCharacteristic::new(
                        BODY_SENSOR_LOCATION,
                        CharacteristicProperties::READ,
                    )
                    .with_value(vec![0x01]),
                ),
        )
}

/// Scans a simulated heart rate monitor, reads its sensor location and
/// subscribes to measurements. Takes an optional JSON session config path.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BluetoothError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    let backend = SimulatedBackend::new(vec![
        heart_rate_monitor(),
        SimulatedPeripheral::new("lamp-07").with_name("Desk Lamp"),
    ]);
    let sim = backend.handle();
    let (session, mut events) = Session::startup(Box::new(backend), Role::Central, config)?;

    session.scan(Some(vec![HEART_RATE])).await?;
    let mut monitor = None;
    while let Some(event) = events.next().await {
        info!("{:?}", event);
        match event {
            SessionEvent::PeripheralDiscovered { peripheral, .. } if monitor.is_none() => {
                session.stop_scan().await?;
                session.connect(peripheral.clone()).await?;
                monitor = Some(peripheral);
            }
            SessionEvent::DiscoveryComplete { peripheral } => {
                let location = session
                    .read_characteristic(peripheral.clone(), HEART_RATE, BODY_SENSOR_LOCATION)
                    .await?;
                println!("sensor location: {:02X?}", location);

                session
                    .subscribe(
                        peripheral.clone(),
                        HEART_RATE,
                        MEASUREMENT,
                        SubscriptionMode::Notification,
                    )
                    .await?;
                for bpm in [72u8, 75, 71] {
                    sim.notify(&peripheral, HEART_RATE, MEASUREMENT, vec![0x00, bpm]);
                }
            }
            SessionEvent::Notification { value, .. } => {
                println!("heart rate: {:?}", value.get(1));
                if value.get(1) == Some(&71) {
                    break;
                }
            }
            _ => {}
        }
    }

    session.shutdown().await?;
    session.cleanup().await
}
