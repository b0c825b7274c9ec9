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

use std::time::Duration;

use ble_bridge::{
    api::{GattRequestKind, NativeEvent},
    sim::{
        BackendCall, SimHandle, SimulatedBackend, SimulatedCharacteristic,
        SimulatedPeripheral, SimulatedService,
    },
    AdapterState, BleUuid, BluetoothError, CharacteristicProperties, ConnectionState,
    EventStream, PausePolicy, PeripheralId, Role, Session, SessionConfig, SessionEvent,
    SubscriptionMode,
};
use futures::future::join_all;

const HEART_RATE: BleUuid = BleUuid::from_u16(0x180D);
const GENERIC_ACCESS: BleUuid = BleUuid::from_u16(0x1800);
const MEASUREMENT: BleUuid = BleUuid::from_u16(0x2A37);
const LOCATION: BleUuid = BleUuid::from_u16(0x2A38);
const CCCD: BleUuid = BleUuid::CLIENT_CHARACTERISTIC_CONFIGURATION;

fn heart_rate_monitor(id: &str) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id)
        .with_name("Pulse")
        .advertising(vec![HEART_RATE])
        .with_service(
            SimulatedService::new(HEART_RATE)
                .with_characteristic(
                    SimulatedCharacteristic::new(
                        MEASUREMENT,
                        CharacteristicProperties::READ
                            | CharacteristicProperties::WRITE
                            | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
                            | CharacteristicProperties::NOTIFY,
                    )
                    .with_value(vec![72])
                    .with_cccd(),
                )
                .with_characteristic(
                    SimulatedCharacteristic::new(LOCATION, CharacteristicProperties::READ)
                        .with_value(vec![1]),
                ),
        )
}

fn start_with(
    peripherals: Vec<SimulatedPeripheral>,
    role: Role,
    config: SessionConfig,
) -> (Session, EventStream, SimHandle) {
    let backend = SimulatedBackend::new(peripherals);
    let sim = backend.handle();
    let (session, events) = Session::startup(Box::new(backend), role, config).unwrap();
    (session, events, sim)
}

fn start(peripherals: Vec<SimulatedPeripheral>) -> (Session, EventStream, SimHandle) {
    start_with(peripherals, Role::Central, SessionConfig::default())
}

/// Returns once the engine handled everything queued before the call.
async fn settle(session: &Session) {
    session.adapter_state().await.unwrap();
}

fn drain(events: &mut EventStream) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Some(event) = events.try_next_event() {
        drained.push(event);
    }
    drained
}

async fn wait_for(
    events: &mut EventStream,
    matches: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events.next_event().await.expect("event stream ended");
        let done = matches(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn connect(session: &Session, events: &mut EventStream, id: &str) -> PeripheralId {
    let peripheral = PeripheralId::from(id);
    session.connect(peripheral.clone()).await.unwrap();
    let target = peripheral.clone();
    wait_for(events, move |e| {
        *e == SessionEvent::DiscoveryComplete {
            peripheral: target.clone(),
        }
    })
    .await;
    peripheral
}

#[tokio::test(start_paused = true)]
async fn startup_reports_ready_and_adapter_state() {
    let (session, mut events, sim) = start(vec![]);
    settle(&session).await;

    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::Ready,
            SessionEvent::AdapterStateChanged(AdapterState::PoweredOn)
        ]
    );
    assert_eq!(session.adapter_state().await, Ok(AdapterState::PoweredOn));
    assert!(!sim.is_released());
}

#[test]
fn startup_outside_a_runtime_fails() {
    let backend = SimulatedBackend::new(vec![]);
    let result = Session::startup(Box::new(backend), Role::Central, SessionConfig::default());
    assert!(matches!(result, Err(BluetoothError::InvalidState(_))));
}

#[tokio::test(start_paused = true)]
async fn scan_filter_reports_matching_peripherals_only() {
    let (session, mut events, _sim) = start(vec![
        heart_rate_monitor("A"),
        SimulatedPeripheral::new("B").advertising(vec![GENERIC_ACCESS]),
    ]);
    settle(&session).await;
    drain(&mut events);

    session.scan(Some(vec![HEART_RATE])).await.unwrap();
    settle(&session).await;

    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::PeripheralDiscovered {
            peripheral: PeripheralId::from("A"),
            name: Some(String::from("Pulse")),
            rssi: Some(-60),
        }]
    );
    assert!(matches!(
        session.peripheral(PeripheralId::from("B")).await,
        Err(BluetoothError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn rescanning_restarts_the_native_scan() {
    let (session, _events, sim) = start(vec![heart_rate_monitor("A")]);
    session.scan(None).await.unwrap();
    session.scan(Some(vec![HEART_RATE])).await.unwrap();
    session.stop_scan().await.unwrap();
    // Idle, so nothing reaches the backend.
    session.stop_scan().await.unwrap();

    let scan_calls: Vec<BackendCall> = sim
        .calls()
        .into_iter()
        .filter(|c| matches!(c, BackendCall::StartScan(_) | BackendCall::StopScan))
        .collect();
    assert_eq!(
        scan_calls,
        vec![
            BackendCall::StartScan(None),
            BackendCall::StopScan,
            BackendCall::StartScan(Some(vec![HEART_RATE])),
            BackendCall::StopScan,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn connecting_discovers_the_attribute_tree_level_by_level() {
    let (session, mut events, _sim) = start(vec![heart_rate_monitor("A")]);
    settle(&session).await;
    drain(&mut events);

    let peripheral = PeripheralId::from("A");
    session.connect(peripheral.clone()).await.unwrap();
    let seen = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::DiscoveryComplete { .. })
    })
    .await;

    assert_eq!(
        seen,
        vec![
            SessionEvent::Connected {
                peripheral: peripheral.clone(),
                name: None
            },
            SessionEvent::ServiceDiscovered {
                peripheral: peripheral.clone(),
                service: HEART_RATE
            },
            SessionEvent::CharacteristicDiscovered {
                peripheral: peripheral.clone(),
                service: HEART_RATE,
                characteristic: MEASUREMENT,
                properties: CharacteristicProperties::new(
                    CharacteristicProperties::READ
                        | CharacteristicProperties::WRITE
                        | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
                        | CharacteristicProperties::NOTIFY
                ),
            },
            SessionEvent::CharacteristicDiscovered {
                peripheral: peripheral.clone(),
                service: HEART_RATE,
                characteristic: LOCATION,
                properties: CharacteristicProperties::new(CharacteristicProperties::READ),
            },
            SessionEvent::DescriptorDiscovered {
                peripheral: peripheral.clone(),
                service: HEART_RATE,
                characteristic: MEASUREMENT,
                descriptor: CCCD,
            },
            SessionEvent::DiscoveryComplete {
                peripheral: peripheral.clone()
            },
        ]
    );

    let snapshot = session.peripheral(peripheral).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.services.len(), 1);
    assert_eq!(snapshot.services[0].characteristics().len(), 2);
    assert_eq!(
        snapshot.services[0].characteristics()[0].descriptors()[0].uuid(),
        CCCD
    );
}

#[tokio::test(start_paused = true)]
async fn transient_discovery_failure_is_retried() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    sim.fail_next_gatt(BluetoothError::System(String::from("busy")));

    let peripheral = connect(&session, &mut events, "A").await;

    let service_discoveries = sim
        .submitted()
        .into_iter()
        .filter(|r| r.kind == GattRequestKind::DiscoverServices)
        .count();
    assert_eq!(service_discoveries, 2);
    let snapshot = session.peripheral(peripheral).await.unwrap();
    assert_eq!(snapshot.services.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connecting_to_an_unknown_peripheral_fails() {
    let (session, mut events, _sim) = start(vec![]);
    let peripheral = PeripheralId::from("ghost");

    assert!(matches!(
        session.connect(peripheral.clone()).await,
        Err(BluetoothError::NotFound(_))
    ));
    let seen = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectFailed { .. })
    })
    .await;
    assert_eq!(seen.last().and_then(SessionEvent::peripheral), Some(&peripheral));
}

#[tokio::test(start_paused = true)]
async fn empty_identifiers_are_rejected_without_native_calls() {
    let (session, _events, sim) = start(vec![heart_rate_monitor("A")]);
    settle(&session).await;
    let calls = sim.calls();

    assert!(matches!(
        session.connect(PeripheralId::from("")).await,
        Err(BluetoothError::InvalidArgument(_))
    ));
    assert!(matches!(
        session
            .read_characteristic(PeripheralId::from(""), HEART_RATE, LOCATION)
            .await,
        Err(BluetoothError::InvalidArgument(_))
    ));
    assert!(matches!(
        session
            .retrieve_known(vec![PeripheralId::from("A"), PeripheralId::from("")])
            .await,
        Err(BluetoothError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.peripheral(PeripheralId::from("")).await,
        Err(BluetoothError::InvalidArgument(_))
    ));
    assert_eq!(sim.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn connect_times_out() {
    let (session, _events, sim) = start(vec![heart_rate_monitor("A")]);
    sim.set_hold_connects(true);

    let result = session.connect(PeripheralId::from("A")).await;
    assert!(matches!(result, Err(BluetoothError::Timeout(_))));
    let snapshot = session.peripheral(PeripheralId::from("A")).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_disconnect_is_forced_after_the_timeout() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_hold_connects(true);

    let started = tokio::time::Instant::now();
    session.disconnect(peripheral.clone()).await.unwrap();
    assert!(started.elapsed() >= SessionConfig::default().connect_timeout());

    let snapshot = session.peripheral(peripheral.clone()).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;

    sim.set_hold_connects(false);
    connect(&session, &mut events, "A").await;
}

#[tokio::test(start_paused = true)]
async fn at_most_one_operation_in_flight_per_peripheral() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_hold_gatt(true);

    let releaser = {
        let sim = sim.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sim.release_held();
            }
        })
    };
    let reads = join_all((0..5).map(|_| {
        session.read_characteristic(peripheral.clone(), HEART_RATE, MEASUREMENT)
    }))
    .await;
    releaser.abort();

    assert!(reads.iter().all(|r| r == &Ok(vec![72])));
    assert_eq!(sim.max_outstanding(&peripheral), 1);
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_every_pending_operation() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_hold_gatt(true);

    let reads = join_all((0..3).map(|_| {
        session.read_characteristic(peripheral.clone(), HEART_RATE, MEASUREMENT)
    }));
    let drop_link = async {
        settle(&session).await;
        sim.inject(NativeEvent::Disconnected(peripheral.clone()));
    };
    let (results, ()) = tokio::join!(reads, drop_link);

    assert_eq!(results.len(), 3);
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(BluetoothError::Disconnected(_)))));
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Disconnected { .. })
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_then_unsubscribe_leaves_no_entry() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;

    session
        .subscribe(
            peripheral.clone(),
            HEART_RATE,
            MEASUREMENT,
            SubscriptionMode::Notification,
        )
        .await
        .unwrap();
    assert_eq!(
        sim.descriptor_value(&peripheral, HEART_RATE, MEASUREMENT, CCCD),
        Some(vec![0x01, 0x00])
    );
    let snapshot = session.peripheral(peripheral.clone()).await.unwrap();
    assert_eq!(snapshot.subscriptions.len(), 1);
    assert!(snapshot.subscriptions[0].active);

    sim.notify(&peripheral, HEART_RATE, MEASUREMENT, vec![0x00, 80]);
    wait_for(&mut events, |e| matches!(e, SessionEvent::Notification { .. })).await;

    session
        .unsubscribe(peripheral.clone(), HEART_RATE, MEASUREMENT)
        .await
        .unwrap();
    assert_eq!(
        sim.descriptor_value(&peripheral, HEART_RATE, MEASUREMENT, CCCD),
        Some(vec![0x00, 0x00])
    );
    let snapshot = session.peripheral(peripheral.clone()).await.unwrap();
    assert!(snapshot.subscriptions.is_empty());

    sim.notify(&peripheral, HEART_RATE, MEASUREMENT, vec![0x00, 81]);
    settle(&session).await;
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::Notification { .. })));
}

#[tokio::test(start_paused = true)]
async fn subscribing_needs_a_capable_characteristic() {
    let (session, mut events, _sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;

    let result = session
        .subscribe(peripheral, HEART_RATE, LOCATION, SubscriptionMode::Notification)
        .await;
    assert!(matches!(result, Err(BluetoothError::NotSupported(_))));
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_unsubscribe_drops_the_subscription() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    session
        .subscribe(
            peripheral.clone(),
            HEART_RATE,
            MEASUREMENT,
            SubscriptionMode::Notification,
        )
        .await
        .unwrap();
    sim.set_hold_gatt(true);

    let unsubscribe = session.unsubscribe(peripheral.clone(), HEART_RATE, MEASUREMENT);
    let disconnect = async {
        settle(&session).await;
        session.disconnect(peripheral.clone()).await
    };
    let (unsubscribed, disconnected) = tokio::join!(unsubscribe, disconnect);

    assert!(matches!(unsubscribed, Err(BluetoothError::Disconnected(_))));
    assert_eq!(disconnected, Ok(()));
    let snapshot = session.peripheral(peripheral).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.subscriptions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_writes_never_reach_the_backend() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    let submitted = sim.submitted().len();

    let result = session
        .write_characteristic(peripheral, HEART_RATE, MEASUREMENT, vec![0; 21], true)
        .await;

    assert_eq!(result, Err(BluetoothError::PayloadTooLarge { len: 21, max: 20 }));
    assert_eq!(sim.submitted().len(), submitted);
}

#[tokio::test(start_paused = true)]
async fn negotiated_mtu_raises_the_write_limit() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A").with_mtu(185)]);
    let peripheral = connect(&session, &mut events, "A").await;

    assert_eq!(
        session.peripheral(peripheral.clone()).await.unwrap().max_write_len,
        182
    );
    session
        .write_characteristic(peripheral.clone(), HEART_RATE, MEASUREMENT, vec![7; 100], true)
        .await
        .unwrap();
    assert_eq!(
        sim.characteristic_value(&peripheral, HEART_RATE, MEASUREMENT),
        Some(vec![7; 100])
    );
}

#[tokio::test(start_paused = true)]
async fn reads_and_writes_round_trip_through_the_queue() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;

    session
        .write_characteristic(peripheral.clone(), HEART_RATE, MEASUREMENT, vec![9], false)
        .await
        .unwrap();
    assert_eq!(
        session
            .read_characteristic(peripheral.clone(), HEART_RATE, MEASUREMENT)
            .await,
        Ok(vec![9])
    );

    session
        .write_descriptor(peripheral.clone(), HEART_RATE, MEASUREMENT, CCCD, vec![0x01, 0x00])
        .await
        .unwrap();
    assert_eq!(
        session
            .read_descriptor(peripheral.clone(), HEART_RATE, MEASUREMENT, CCCD)
            .await,
        Ok(vec![0x01, 0x00])
    );
    assert!(sim.submitted().iter().any(|r| matches!(
        r.kind,
        GattRequestKind::WriteCharacteristic {
            with_response: false,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn unanswered_operations_time_out() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_hold_gatt(true);

    let result = session
        .read_characteristic(peripheral.clone(), HEART_RATE, LOCATION)
        .await;
    assert!(matches!(result, Err(BluetoothError::Timeout(_))));

    // The queue keeps going after a timeout.
    sim.set_hold_gatt(false);
    assert_eq!(
        session
            .read_characteristic(peripheral, HEART_RATE, MEASUREMENT)
            .await,
        Ok(vec![72])
    );
}

#[tokio::test(start_paused = true)]
async fn operations_on_unknown_or_disconnected_peripherals_fail() {
    let (session, mut events, _sim) = start(vec![heart_rate_monitor("A")]);

    assert!(matches!(
        session
            .read_characteristic(PeripheralId::from("A"), HEART_RATE, MEASUREMENT)
            .await,
        Err(BluetoothError::NotFound(_))
    ));

    let peripheral = connect(&session, &mut events, "A").await;
    session.disconnect(peripheral.clone()).await.unwrap();
    assert!(matches!(
        session
            .read_characteristic(peripheral.clone(), HEART_RATE, MEASUREMENT)
            .await,
        Err(BluetoothError::InvalidState(_))
    ));
    assert!(matches!(
        session.disconnect(peripheral).await,
        Err(BluetoothError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn rssi_is_reported_as_an_event() {
    let (session, mut events, _sim) =
        start(vec![heart_rate_monitor("A").with_rssi(-42)]);
    let peripheral = connect(&session, &mut events, "A").await;

    session.read_rssi(peripheral.clone()).await.unwrap();
    let seen = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::RssiUpdated { .. })
    })
    .await;
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::RssiUpdated {
            peripheral: peripheral.clone(),
            rssi: -42
        })
    );
    assert_eq!(session.peripheral(peripheral).await.unwrap().rssi, Some(-42));
}

#[tokio::test(start_paused = true)]
async fn paused_sessions_buffer_events_until_resumed() {
    let (session, mut events, _sim) = start(vec![
        heart_rate_monitor("A"),
        SimulatedPeripheral::new("B"),
    ]);
    settle(&session).await;
    drain(&mut events);

    session.pause(true).await.unwrap();
    session.scan(None).await.unwrap();
    settle(&session).await;
    assert!(drain(&mut events).is_empty());

    session.pause(false).await.unwrap();
    let resumed = drain(&mut events);
    assert_eq!(resumed.len(), 2);
    assert!(resumed
        .iter()
        .all(|e| matches!(e, SessionEvent::PeripheralDiscovered { .. })));
}

#[tokio::test(start_paused = true)]
async fn link_loss_is_delivered_while_paused() {
    let config = SessionConfig {
        pause_buffer_capacity: 2,
        ..SessionConfig::default()
    };
    let (session, mut events, sim) =
        start_with(vec![heart_rate_monitor("A")], Role::Central, config);
    let peripheral = connect(&session, &mut events, "A").await;
    session
        .subscribe(
            peripheral.clone(),
            HEART_RATE,
            MEASUREMENT,
            SubscriptionMode::Notification,
        )
        .await
        .unwrap();
    settle(&session).await;
    drain(&mut events);

    session.pause(true).await.unwrap();
    for beat in [70, 71, 72] {
        sim.notify(&peripheral, HEART_RATE, MEASUREMENT, vec![0x00, beat]);
    }
    sim.inject(NativeEvent::Disconnected(peripheral.clone()));
    sim.inject(NativeEvent::Error(String::from("radio hiccup")));
    settle(&session).await;

    let while_paused = drain(&mut events);
    assert!(while_paused
        .iter()
        .any(|e| matches!(e, SessionEvent::Disconnected { .. })));
    assert!(while_paused.contains(&SessionEvent::Error {
        peripheral: None,
        error: BluetoothError::System(String::from("radio hiccup")),
    }));
    assert!(!while_paused
        .iter()
        .any(|e| matches!(e, SessionEvent::Notification { .. })));

    session.pause(false).await.unwrap();
    let beats: Vec<Vec<u8>> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Notification { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(beats, vec![vec![0x00, 71], vec![0x00, 72]]);
}

#[tokio::test(start_paused = true)]
async fn drop_policy_discards_scan_results_while_paused() {
    let config = SessionConfig {
        pause_policy: PausePolicy::Drop,
        ..SessionConfig::default()
    };
    let (session, mut events, _sim) =
        start_with(vec![heart_rate_monitor("A")], Role::Central, config);
    settle(&session).await;
    drain(&mut events);

    session.pause(true).await.unwrap();
    session.scan(None).await.unwrap();
    session.connect(PeripheralId::from("A")).await.unwrap();
    settle(&session).await;

    let delivered = drain(&mut events);
    assert!(delivered
        .iter()
        .any(|e| matches!(e, SessionEvent::Connected { .. })));
    assert!(!delivered
        .iter()
        .any(|e| matches!(e, SessionEvent::PeripheralDiscovered { .. })));
}

#[tokio::test(start_paused = true)]
async fn retrieval_is_unsupported_unless_the_backend_can_do_it() {
    let (session, _events, sim) = start(vec![heart_rate_monitor("A").system_connected()]);

    assert!(matches!(
        session.retrieve_connected(Some(vec![HEART_RATE])).await,
        Err(BluetoothError::NotSupported(_))
    ));

    sim.set_can_retrieve(true);
    let connected = session
        .retrieve_connected(Some(vec![HEART_RATE]))
        .await
        .unwrap();
    assert_eq!(connected.len(), 1);
    let known = session
        .retrieve_known(vec![PeripheralId::from("A"), PeripheralId::from("Z")])
        .await
        .unwrap();
    assert_eq!(known.len(), 1);

    // Retrieved peripherals can be connected without scanning.
    let snapshot = session.peripheral(PeripheralId::from("A")).await.unwrap();
    assert_eq!(snapshot.name.as_deref(), Some("Pulse"));
}

#[tokio::test(start_paused = true)]
async fn slow_retrieval_does_not_hold_up_other_peripherals() {
    let (session, mut events, sim) = start(vec![
        heart_rate_monitor("A"),
        heart_rate_monitor("B").system_connected(),
    ]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_can_retrieve(true);
    sim.set_retrieve_delay(Duration::from_secs(60));

    let lookup = {
        let session = session.clone();
        tokio::spawn(async move { session.retrieve_connected(None).await })
    };
    settle(&session).await;

    let started = tokio::time::Instant::now();
    let location = session
        .read_characteristic(peripheral, HEART_RATE, LOCATION)
        .await;
    assert_eq!(location, Ok(vec![1]));
    assert!(started.elapsed() < Duration::from_secs(1));

    // The lookup outlives the operation timeout.
    assert!(matches!(
        lookup.await.unwrap(),
        Err(BluetoothError::Timeout(_))
    ));

    sim.set_retrieve_delay(Duration::from_secs(1));
    let connected = session.retrieve_connected(None).await.unwrap();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].id, PeripheralId::from("B"));
}

#[tokio::test(start_paused = true)]
async fn peripheral_role_rejects_central_operations() {
    let (session, _events, _sim) = start_with(
        vec![heart_rate_monitor("A")],
        Role::Peripheral,
        SessionConfig::default(),
    );

    assert!(matches!(
        session.scan(None).await,
        Err(BluetoothError::InvalidState(_))
    ));
    assert!(matches!(
        session.connect(PeripheralId::from("A")).await,
        Err(BluetoothError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn adapter_power_loss_disconnects_everything() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;

    sim.inject(NativeEvent::AdapterStateChanged(AdapterState::PoweredOff));
    wait_for(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;

    assert_eq!(session.adapter_state().await, Ok(AdapterState::PoweredOff));
    assert_eq!(
        session.scan(None).await,
        Err(BluetoothError::AdapterUnavailable)
    );
    assert_eq!(
        session.connect(peripheral).await,
        Err(BluetoothError::AdapterUnavailable)
    );
}

#[tokio::test(start_paused = true)]
async fn remove_peripheral_requires_a_disconnected_peripheral() {
    let (session, mut events, _sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;

    assert!(matches!(
        session.remove_peripheral(peripheral.clone()).await,
        Err(BluetoothError::InvalidState(_))
    ));
    session.disconnect(peripheral.clone()).await.unwrap();
    session.remove_peripheral(peripheral.clone()).await.unwrap();
    assert!(matches!(
        session.peripheral(peripheral).await,
        Err(BluetoothError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_and_forgets_every_peripheral() {
    let (session, mut events, sim) =
        start(vec![heart_rate_monitor("A"), heart_rate_monitor("B")]);
    session.scan(None).await.unwrap();
    let a = connect(&session, &mut events, "A").await;
    let b = connect(&session, &mut events, "B").await;

    session.shutdown().await.unwrap();

    assert!(sim.calls().contains(&BackendCall::StopScan));
    for peripheral in [a, b] {
        assert!(matches!(
            session.peripheral(peripheral).await,
            Err(BluetoothError::NotFound(_))
        ));
    }
    // Still usable afterwards.
    session.scan(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cleanup_only_runs_once() {
    let (session, _events, sim) = start(vec![heart_rate_monitor("A")]);

    session.cleanup().await.unwrap();
    assert!(sim.is_released());
    assert_eq!(session.cleanup().await, Err(BluetoothError::AlreadyCleanedUp));
    assert_eq!(
        session.scan(None).await,
        Err(BluetoothError::AdapterUnavailable)
    );
}

#[tokio::test]
async fn blocking_cleanup_from_outside_the_runtime() {
    let (session, _events, sim) = start(vec![]);

    let cleaner = session.clone();
    let result = tokio::task::spawn_blocking(move || cleaner.blocking_cleanup())
        .await
        .unwrap();

    assert_eq!(result, Ok(()));
    assert!(sim.is_released());
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_before_confirmation_leaves_no_entry() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_hold_gatt(true);

    let releaser = {
        let sim = sim.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sim.release_held();
            }
        })
    };
    let (subscribed, unsubscribed) = tokio::join!(
        session.subscribe(
            peripheral.clone(),
            HEART_RATE,
            MEASUREMENT,
            SubscriptionMode::Notification,
        ),
        session.unsubscribe(peripheral.clone(), HEART_RATE, MEASUREMENT),
    );
    releaser.abort();

    assert_eq!(subscribed, Ok(()));
    assert_eq!(unsubscribed, Ok(()));
    let snapshot = session.peripheral(peripheral).await.unwrap();
    assert!(snapshot.subscriptions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnecting_before_subscription_confirmation_leaves_no_entry() {
    let (session, mut events, sim) = start(vec![heart_rate_monitor("A")]);
    let peripheral = connect(&session, &mut events, "A").await;
    sim.set_hold_gatt(true);

    let subscribe = session.subscribe(
        peripheral.clone(),
        HEART_RATE,
        MEASUREMENT,
        SubscriptionMode::Notification,
    );
    let drop_link = async {
        settle(&session).await;
        sim.inject(NativeEvent::Disconnected(peripheral.clone()));
    };
    let (subscribed, ()) = tokio::join!(subscribe, drop_link);

    assert!(matches!(subscribed, Err(BluetoothError::Disconnected(_))));
    let snapshot = session.peripheral(peripheral).await.unwrap();
    assert!(snapshot.subscriptions.is_empty());
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, SessionEvent::SubscriptionChanged { .. })));
}
