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

//! In-process BLE stack with virtual peripherals. Backs the demo binary and
//! the tests; a `SimHandle` stays with the caller to script and inspect the
//! backend after it was moved into the session.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::{
    api::{
        BleBackend, GattRequest, GattRequestKind, KnownPeripheral, NativeEvent,
        NativeEventSender, OperationId, PeripheralDirectory, PeripheralQuery,
    },
    common::{
        AdapterState, Advertisement, BleUuid, BluetoothError,
        CharacteristicProperties, PeripheralId, Role,
    },
};

#[derive(Clone, Debug)]
pub struct SimulatedCharacteristic {
    uuid: BleUuid,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<(BleUuid, Vec<u8>)>,
}

impl SimulatedCharacteristic {
    pub fn new(uuid: BleUuid, properties: u8) -> Self {
        SimulatedCharacteristic {
            uuid,
            properties: CharacteristicProperties::new(properties),
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn with_descriptor(mut self, uuid: BleUuid, value: Vec<u8>) -> Self {
        self.descriptors.push((uuid, value));
        self
    }

    /// Adds a disabled Client Characteristic Configuration descriptor.
    pub fn with_cccd(self) -> Self {
        self.with_descriptor(
            BleUuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
            vec![0x00, 0x00],
        )
    }
}

#[derive(Clone, Debug)]
pub struct SimulatedService {
    uuid: BleUuid,
    characteristics: Vec<SimulatedCharacteristic>,
}

impl SimulatedService {
    pub fn new(uuid: BleUuid) -> Self {
        SimulatedService {
            uuid,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: SimulatedCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

#[derive(Clone, Debug)]
pub struct SimulatedPeripheral {
    id: PeripheralId,
    name: Option<String>,
    rssi: i16,
    advertised_services: Vec<BleUuid>,
    services: Vec<SimulatedService>,
    mtu: Option<u16>,
    /// Connected to the host outside of this session.
    system_connected: bool,
}

impl SimulatedPeripheral {
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        SimulatedPeripheral {
            id: id.into(),
            name: None,
            rssi: -60,
            advertised_services: Vec::new(),
            services: Vec::new(),
            mtu: None,
            system_connected: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn advertising(mut self, services: Vec<BleUuid>) -> Self {
        self.advertised_services = services;
        self
    }

    pub fn with_service(mut self, service: SimulatedService) -> Self {
        self.services.push(service);
        self
    }

    /// ATT MTU reported right after connecting.
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn system_connected(mut self) -> Self {
        self.system_connected = true;
        self
    }

    fn advertisement(&self) -> Advertisement {
        let adv = Advertisement::new(self.id.clone())
            .with_rssi(self.rssi)
            .with_services(self.advertised_services.clone());
        match &self.name {
            Some(name) => adv.with_name(name.clone()),
            None => adv,
        }
    }

    fn known(&self) -> KnownPeripheral {
        KnownPeripheral {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    fn characteristic_mut(
        &mut self,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<&mut SimulatedCharacteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == characteristic)
    }

    fn descriptor_mut(
        &mut self,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Option<&mut Vec<u8>> {
        self.characteristic_mut(service, characteristic)?
            .descriptors
            .iter_mut()
            .find(|(uuid, _)| *uuid == descriptor)
            .map(|(_, value)| value)
    }
}

/// Every call the session made into the backend, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    Start(Role),
    StartScan(Option<Vec<BleUuid>>),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    Submit(GattRequest),
    ReadRssi(PeripheralId),
    Retrieve(PeripheralQuery),
    Release,
}

#[derive(Default)]
struct SimState {
    events: Option<NativeEventSender>,
    calls: Vec<BackendCall>,
    peripherals: Vec<SimulatedPeripheral>,
    /// Nothing is answered unless the test does it.
    manual: bool,
    hold_gatt: bool,
    hold_connects: bool,
    can_retrieve: bool,
    retrieve_delay: Duration,
    held: VecDeque<GattRequest>,
    gatt_failures: VecDeque<BluetoothError>,
    submit_failures: VecDeque<BluetoothError>,
    outstanding: HashMap<PeripheralId, usize>,
    max_outstanding: HashMap<PeripheralId, usize>,
    released: bool,
}

impl SimState {
    fn emit(&self, event: NativeEvent) {
        match &self.events {
            Some(events) => {
                trace!("Simulating {:?}", event);
                // Fails only once the session is gone.
                let _ = events.send(event);
            }
            None => debug!("Backend not started, dropping {:?}", event),
        }
    }

    fn peripheral_mut(&mut self, id: &PeripheralId) -> Option<&mut SimulatedPeripheral> {
        self.peripherals.iter_mut().find(|p| &p.id == id)
    }

    fn finish(&mut self, request: &GattRequest, result: Result<Vec<u8>, BluetoothError>) {
        if let Some(count) = self.outstanding.get_mut(&request.peripheral) {
            *count = count.saturating_sub(1);
        }
        self.emit(NativeEvent::GattCompleted {
            peripheral: request.peripheral.clone(),
            op: request.op,
            result,
        });
    }

    /// Play the request against the virtual peripheral, emitting discovery
    /// results along the way.
    fn perform(&mut self, request: &GattRequest) -> Result<Vec<u8>, BluetoothError> {
        let id = request.peripheral.clone();
        let not_found = |what: String| BluetoothError::NotFound(format!("{} on {}", what, id));

        let Some(peripheral) = self.peripheral_mut(&request.peripheral) else {
            return Err(not_found(String::from("peripheral")));
        };
        let mut discovered = Vec::new();
        let result = match &request.kind {
            GattRequestKind::DiscoverServices => {
                for service in &peripheral.services {
                    discovered.push(NativeEvent::ServiceDiscovered {
                        peripheral: id.clone(),
                        service: service.uuid,
                    });
                }
                Ok(Vec::new())
            }
            GattRequestKind::DiscoverCharacteristics { service } => {
                match peripheral.services.iter().find(|s| s.uuid == *service) {
                    Some(found) => {
                        for characteristic in &found.characteristics {
                            discovered.push(NativeEvent::CharacteristicDiscovered {
                                peripheral: id.clone(),
                                service: *service,
                                characteristic: characteristic.uuid,
                                properties: characteristic.properties,
                            });
                        }
                        Ok(Vec::new())
                    }
                    None => Err(not_found(format!("service {}", service))),
                }
            }
            GattRequestKind::DiscoverDescriptors {
                service,
                characteristic,
            } => match peripheral.characteristic_mut(*service, *characteristic) {
                Some(found) => {
                    for (descriptor, _) in &found.descriptors {
                        discovered.push(NativeEvent::DescriptorDiscovered {
                            peripheral: id.clone(),
                            service: *service,
                            characteristic: *characteristic,
                            descriptor: *descriptor,
                        });
                    }
                    Ok(Vec::new())
                }
                None => Err(not_found(format!("characteristic {}", characteristic))),
            },
            GattRequestKind::ReadCharacteristic {
                service,
                characteristic,
            } => peripheral
                .characteristic_mut(*service, *characteristic)
                .map(|c| c.value.clone())
                .ok_or_else(|| not_found(format!("characteristic {}", characteristic))),
            GattRequestKind::WriteCharacteristic {
                service,
                characteristic,
                value,
                ..
            } => peripheral
                .characteristic_mut(*service, *characteristic)
                .map(|c| {
                    c.value = value.clone();
                    Vec::new()
                })
                .ok_or_else(|| not_found(format!("characteristic {}", characteristic))),
            GattRequestKind::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            } => peripheral
                .descriptor_mut(*service, *characteristic, *descriptor)
                .map(|v| v.clone())
                .ok_or_else(|| not_found(format!("descriptor {}", descriptor))),
            GattRequestKind::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                value,
            } => peripheral
                .descriptor_mut(*service, *characteristic, *descriptor)
                .map(|v| {
                    *v = value.clone();
                    Vec::new()
                })
                .ok_or_else(|| not_found(format!("descriptor {}", descriptor))),
        };

        for event in discovered {
            self.emit(event);
        }
        result
    }

    fn answer(&mut self, request: GattRequest) {
        let result = match self.gatt_failures.pop_front() {
            Some(err) => Err(err),
            None => self.perform(&request),
        };
        self.finish(&request, result);
    }
}

/// Script and inspect a `SimulatedBackend` from outside the session.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// GATT requests the backend accepted, in order.
    pub fn submitted(&self) -> Vec<GattRequest> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Submit(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Requests waiting for a completion from the test.
    pub fn held(&self) -> Vec<GattRequest> {
        self.lock().held.iter().cloned().collect()
    }

    /// Remove a held request without answering it.
    pub fn take_held(&self, op: OperationId) -> Option<GattRequest> {
        let mut state = self.lock();
        let index = state.held.iter().position(|r| r.op == op)?;
        let request = state.held.remove(index)?;
        if let Some(count) = state.outstanding.get_mut(&request.peripheral) {
            *count = count.saturating_sub(1);
        }
        Some(request)
    }

    /// Keep GATT requests until `release_held()` or `complete()`.
    pub fn set_hold_gatt(&self, hold: bool) {
        self.lock().hold_gatt = hold;
    }

    /// Leave connection and disconnection requests pending instead of
    /// answering them.
    pub fn set_hold_connects(&self, hold: bool) {
        self.lock().hold_connects = hold;
    }

    pub fn set_can_retrieve(&self, can_retrieve: bool) {
        self.lock().can_retrieve = can_retrieve;
    }

    /// Lookups answer only after `delay`.
    pub fn set_retrieve_delay(&self, delay: Duration) {
        self.lock().retrieve_delay = delay;
    }

    /// Answer every held request against the virtual peripherals, oldest
    /// first.
    pub fn release_held(&self) {
        let mut state = self.lock();
        while let Some(request) = state.held.pop_front() {
            state.answer(request);
        }
    }

    /// Answer the held request `op` with `result`.
    pub fn complete(&self, op: OperationId, result: Result<Vec<u8>, BluetoothError>) -> bool {
        let mut state = self.lock();
        let Some(index) = state.held.iter().position(|r| r.op == op) else {
            return false;
        };
        let Some(request) = state.held.remove(index) else {
            return false;
        };
        state.finish(&request, result);
        true
    }

    /// The next answered GATT request fails with `err`.
    pub fn fail_next_gatt(&self, err: BluetoothError) {
        self.lock().gatt_failures.push_back(err);
    }

    /// The next `submit()` call is refused with `err`.
    pub fn fail_next_submit(&self, err: BluetoothError) {
        self.lock().submit_failures.push_back(err);
    }

    /// Deliver `event` the way a native callback would.
    pub fn inject(&self, event: NativeEvent) {
        self.lock().emit(event);
    }

    pub fn notify(
        &self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        value: Vec<u8>,
    ) {
        self.inject(NativeEvent::ValueNotified {
            peripheral: peripheral.clone(),
            service,
            characteristic,
            value,
        });
    }

    /// Most GATT requests ever outstanding at once on `peripheral`.
    pub fn max_outstanding(&self, peripheral: &PeripheralId) -> usize {
        self.lock()
            .max_outstanding
            .get(peripheral)
            .copied()
            .unwrap_or_default()
    }

    pub fn characteristic_value(
        &self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<Vec<u8>> {
        self.lock()
            .peripheral_mut(peripheral)?
            .characteristic_mut(service, characteristic)
            .map(|c| c.value.clone())
    }

    pub fn descriptor_value(
        &self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Option<Vec<u8>> {
        self.lock()
            .peripheral_mut(peripheral)?
            .descriptor_mut(service, characteristic, descriptor)
            .cloned()
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }
}

/// `BleBackend` over virtual peripherals. By default every request is
/// answered immediately from the calling thread; `manual()` answers nothing.
pub struct SimulatedBackend {
    handle: SimHandle,
}

impl SimulatedBackend {
    pub fn new(peripherals: Vec<SimulatedPeripheral>) -> Self {
        let state = SimState {
            peripherals,
            ..SimState::default()
        };
        SimulatedBackend {
            handle: SimHandle {
                state: Arc::new(Mutex::new(state)),
            },
        }
    }

    /// A backend that records calls but leaves every answer to the test.
    pub fn manual() -> Self {
        let backend = Self::new(Vec::new());
        backend.handle.lock().manual = true;
        backend
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }
}

impl BleBackend for SimulatedBackend {
    fn start(&mut self, role: Role, events: NativeEventSender) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state.calls.push(BackendCall::Start(role));
        state.events = Some(events);
        state.released = false;
        state.emit(NativeEvent::AdapterStateChanged(AdapterState::PoweredOn));
        Ok(())
    }

    fn start_scan(&mut self, services: Option<&[BleUuid]>) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state
            .calls
            .push(BackendCall::StartScan(services.map(<[BleUuid]>::to_vec)));
        if state.manual {
            return Ok(());
        }
        // The native filter is advisory; the session filters again.
        for peripheral in &state.peripherals {
            state.emit(NativeEvent::AdvertisementReceived(peripheral.advertisement()));
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), BluetoothError> {
        self.handle.lock().calls.push(BackendCall::StopScan);
        Ok(())
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state.calls.push(BackendCall::Connect(peripheral.clone()));
        if state.manual || state.hold_connects {
            return Ok(());
        }

        let mtu = state.peripheral_mut(peripheral).map(|p| p.mtu);
        match mtu {
            Some(mtu) => {
                state.emit(NativeEvent::Connected(peripheral.clone()));
                if let Some(mtu) = mtu {
                    state.emit(NativeEvent::MtuChanged {
                        peripheral: peripheral.clone(),
                        mtu,
                    });
                }
            }
            None => state.emit(NativeEvent::ConnectFailed {
                peripheral: peripheral.clone(),
                error: BluetoothError::NotFound(format!("peripheral {}", peripheral)),
            }),
        }
        Ok(())
    }

    fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state.calls.push(BackendCall::Disconnect(peripheral.clone()));
        state.held.retain(|r| &r.peripheral != peripheral);
        state.outstanding.remove(peripheral);
        if !state.manual && !state.hold_connects {
            state.emit(NativeEvent::Disconnected(peripheral.clone()));
        }
        Ok(())
    }

    fn submit(&mut self, request: GattRequest) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state.calls.push(BackendCall::Submit(request.clone()));
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }

        if let GattRequestKind::WriteCharacteristic {
            with_response: false,
            ..
        } = &request.kind
        {
            if !state.manual {
                // Nobody hears back about the outcome.
                let _ = state.perform(&request);
            }
            return Ok(());
        }

        let count = state
            .outstanding
            .entry(request.peripheral.clone())
            .or_default();
        *count += 1;
        let count = *count;
        let max = state
            .max_outstanding
            .entry(request.peripheral.clone())
            .or_default();
        *max = (*max).max(count);

        if state.manual || state.hold_gatt {
            state.held.push_back(request);
        } else {
            state.answer(request);
        }
        Ok(())
    }

    fn read_rssi(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state.calls.push(BackendCall::ReadRssi(peripheral.clone()));
        if state.manual {
            return Ok(());
        }
        let rssi = state
            .peripheral_mut(peripheral)
            .map(|p| p.rssi)
            .ok_or_else(|| BluetoothError::NotFound(format!("peripheral {}", peripheral)))?;
        state.emit(NativeEvent::RssiRead {
            peripheral: peripheral.clone(),
            rssi,
        });
        Ok(())
    }

    fn directory(&self) -> Option<Arc<dyn PeripheralDirectory>> {
        Some(Arc::new(self.handle.clone()))
    }

    fn release(&mut self) -> Result<(), BluetoothError> {
        let mut state = self.handle.lock();
        state.calls.push(BackendCall::Release);
        state.events = None;
        state.held.clear();
        state.released = true;
        Ok(())
    }
}

#[async_trait]
impl PeripheralDirectory for SimHandle {
    async fn retrieve(
        &self,
        query: &PeripheralQuery,
    ) -> Result<Vec<KnownPeripheral>, BluetoothError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(BackendCall::Retrieve(query.clone()));
            state.retrieve_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if !state.can_retrieve {
            return Err(BluetoothError::NotSupported(String::from(
                "enumerating peripherals without scanning",
            )));
        }
        let known = state
            .peripherals
            .iter()
            .filter(|p| match query {
                PeripheralQuery::ConnectedWithServices(services) => {
                    p.system_connected && p.advertisement().matches(services.as_deref())
                }
                PeripheralQuery::Identifiers(ids) => ids.contains(&p.id),
            })
            .map(SimulatedPeripheral::known)
            .collect();
        Ok(known)
    }
}
