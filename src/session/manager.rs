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

use std::collections::HashMap;

use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};

use super::{
    dispatcher::EventDispatcher,
    queue::{OperationKind, OperationQueue, PendingOperation},
    registry::{DeviceRegistry, PeripheralSnapshot},
    subscriptions::SubscriptionTable,
    Command, Inbox, Reply, SessionEvent,
};
use crate::{
    api::{
        BleBackend, GattRequest, KnownPeripheral, NativeEvent, NativeEventSender,
        OperationId, PeripheralQuery,
    },
    common::{
        AdapterState, Advertisement, BleUuid, BluetoothError,
        CharacteristicProperties, ConnectionState, PeripheralId, Role,
        SessionConfig,
    },
};

enum Lifecycle {
    Running,
    /// Cleanup was requested and waits for in-flight operations.
    CleaningUp(Reply<()>),
    Released,
}

/// All session state plus the logic driving it. Only the engine task touches
/// it, one command or native event at a time.
pub(crate) struct SessionManager {
    backend: Box<dyn BleBackend>,
    role: Role,
    config: SessionConfig,
    adapter_state: AdapterState,
    registry: DeviceRegistry,
    subscriptions: SubscriptionTable,
    queues: HashMap<PeripheralId, OperationQueue>,
    dispatcher: EventDispatcher,
    next_op: u64,
    shutdown_waiters: Vec<Reply<()>>,
    lifecycle: Lifecycle,
    /// Lookups answer through here without keeping the engine alive.
    inbox: Option<mpsc::WeakUnboundedSender<Inbox>>,
    retrievals: HashMap<OperationId, PendingRetrieval>,
}

struct PendingRetrieval {
    reply: Reply<Vec<KnownPeripheral>>,
    deadline: Instant,
}

impl SessionManager {
    pub(crate) fn new(
        backend: Box<dyn BleBackend>,
        role: Role,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let dispatcher = EventDispatcher::new(
            events,
            config.pause_policy,
            config.pause_buffer_capacity,
        );
        SessionManager {
            backend,
            role,
            registry: DeviceRegistry::new(config.default_max_write_len),
            config,
            adapter_state: AdapterState::Unknown,
            subscriptions: SubscriptionTable::default(),
            queues: HashMap::new(),
            dispatcher,
            next_op: 0,
            shutdown_waiters: Vec::new(),
            lifecycle: Lifecycle::Running,
            inbox: None,
            retrievals: HashMap::new(),
        }
    }

    /// Bring up the backend and announce the session.
    pub(crate) fn start(&mut self, events: NativeEventSender) -> Result<(), BluetoothError> {
        self.inbox = Some(events.downgrade());
        self.backend.start(self.role, events)?;
        info!("Session started as {:?}.", self.role);
        self.dispatcher.emit(SessionEvent::Ready);
        Ok(())
    }

    fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running)
    }

    fn ensure_central(&self) -> Result<(), BluetoothError> {
        match self.role {
            Role::Central => Ok(()),
            Role::Peripheral => Err(BluetoothError::InvalidState(String::from(
                "operation requires the central role",
            ))),
        }
    }

    fn ensure_powered(&self) -> Result<(), BluetoothError> {
        match self.adapter_state {
            AdapterState::PoweredOff
            | AdapterState::Resetting
            | AdapterState::Unauthorized
            | AdapterState::Unsupported => Err(BluetoothError::AdapterUnavailable),
            _ => Ok(()),
        }
    }

    fn next_operation_id(&mut self) -> OperationId {
        self.next_op += 1;
        OperationId(self.next_op)
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        if self.is_running() {
            if let Err(err) = command.check_identifiers() {
                command.reject(err);
                return;
            }
        }
        match command {
            Command::Cleanup(reply) => self.cleanup(reply),
            command if !self.is_running() => {
                command.reject(BluetoothError::AdapterUnavailable)
            }
            Command::AdapterState(reply) => {
                let _ = reply.send(Ok(self.adapter_state));
            }
            Command::Inspect { peripheral, reply } => {
                let _ = reply.send(self.snapshot(&peripheral));
            }
            Command::Shutdown(reply) => self.shutdown(reply),
            Command::Pause { paused, reply } => {
                self.dispatcher.set_paused(paused);
                let _ = reply.send(Ok(()));
            }
            Command::Scan { services, reply } => {
                let _ = reply.send(self.scan(services));
            }
            Command::StopScan(reply) => {
                let _ = reply.send(self.stop_scan());
            }
            Command::Connect { peripheral, reply } => self.connect(peripheral, reply),
            Command::Disconnect { peripheral, reply } => self.disconnect(peripheral, reply),
            Command::Retrieve { query, reply } => self.retrieve(query, reply),
            Command::Gatt {
                peripheral,
                operation,
                reply,
            } => self.enqueue(peripheral, operation, reply),
            Command::ReadRssi { peripheral, reply } => {
                let _ = reply.send(self.read_rssi(&peripheral));
            }
            Command::RemovePeripheral { peripheral, reply } => {
                let _ = reply.send(self.remove_peripheral(&peripheral));
            }
        }
    }

    fn scan(&mut self, services: Option<Vec<BleUuid>>) -> Result<(), BluetoothError> {
        self.ensure_central()?;
        self.ensure_powered()?;
        if self.registry.end_scan() {
            debug!("Restarting active scan.");
            self.backend.stop_scan()?;
        }
        self.backend.start_scan(services.as_deref())?;
        info!("Scanning for peripherals, service filter {:?}.", services);
        self.registry.begin_scan(services);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), BluetoothError> {
        self.ensure_central()?;
        if !self.registry.end_scan() {
            debug!("No active scan to stop.");
            return Ok(());
        }
        info!("Scan stopped.");
        self.backend.stop_scan()
    }

    fn connect(&mut self, peripheral: PeripheralId, reply: Reply<()>) {
        if let Err(err) = self.ensure_central().and_then(|_| self.ensure_powered()) {
            let _ = reply.send(Err(err));
            return;
        }

        let deadline = Instant::now() + self.config.connect_timeout();
        let record = self.registry.get_or_insert(&peripheral);
        if record.state != ConnectionState::Disconnected {
            let _ = reply.send(Err(BluetoothError::InvalidState(format!(
                "can't connect to {} while {:?}",
                peripheral, record.state
            ))));
            return;
        }
        if let Err(err) = self.backend.connect(&peripheral) {
            warn!("Failed to connect to {}: {}", peripheral, err);
            let _ = reply.send(Err(err));
            return;
        }

        info!("Connecting to {}.", peripheral);
        record.state = ConnectionState::Connecting;
        record.state_deadline = Some(deadline);
        record.connect_waiter = Some(reply);
    }

    fn disconnect(&mut self, peripheral: PeripheralId, reply: Reply<()>) {
        if let Err(err) = self.ensure_central() {
            let _ = reply.send(Err(err));
            return;
        }

        let deadline = Instant::now() + self.config.connect_timeout();
        let Some(record) = self.registry.get_mut(&peripheral) else {
            let _ = reply.send(Err(BluetoothError::NotFound(format!(
                "peripheral {}",
                peripheral
            ))));
            return;
        };
        match record.state {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            state => {
                let _ = reply.send(Err(BluetoothError::InvalidState(format!(
                    "can't disconnect from {} while {:?}",
                    peripheral, state
                ))));
                return;
            }
        }
        if let Err(err) = self.backend.disconnect(&peripheral) {
            warn!("Failed to disconnect from {}: {}", peripheral, err);
            let _ = reply.send(Err(err));
            return;
        }

        info!("Disconnecting from {}.", peripheral);
        record.state = ConnectionState::Disconnecting;
        record.state_deadline = Some(deadline);
        record.disconnect_waiters.push(reply);
    }

    /// Start a directory lookup on its own task. The answer comes back as
    /// `Inbox::Retrieved` and is bounded by the operation timeout.
    fn retrieve(&mut self, query: PeripheralQuery, reply: Reply<Vec<KnownPeripheral>>) {
        if let Err(err) = self.ensure_central() {
            let _ = reply.send(Err(err));
            return;
        }
        let Some(directory) = self.backend.directory() else {
            let _ = reply.send(Err(BluetoothError::NotSupported(String::from(
                "enumerating peripherals without scanning",
            ))));
            return;
        };
        let Some(inbox) = self.inbox.clone() else {
            let _ = reply.send(Err(BluetoothError::AdapterUnavailable));
            return;
        };

        let id = self.next_operation_id();
        debug!("Retrieving {:?} as {}.", query, id);
        self.retrievals.insert(
            id,
            PendingRetrieval {
                reply,
                deadline: Instant::now() + self.config.operation_timeout(),
            },
        );
        tokio::spawn(async move {
            let result = directory.retrieve(&query).await;
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Inbox::Retrieved { id, result });
            }
        });
    }

    pub(crate) fn on_retrieved(
        &mut self,
        id: OperationId,
        result: Result<Vec<KnownPeripheral>, BluetoothError>,
    ) {
        let Some(pending) = self.retrievals.remove(&id) else {
            debug!("Dropping late answer to lookup {}.", id);
            return;
        };
        if let Ok(known) = &result {
            debug!("Lookup {} returned {} peripherals.", id, known.len());
            for peripheral in known {
                self.registry.register_known(peripheral);
            }
        }
        let _ = pending.reply.send(result);
    }

    fn read_rssi(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError> {
        self.ensure_central()?;
        let record = self
            .registry
            .get(peripheral)
            .ok_or_else(|| BluetoothError::NotFound(format!("peripheral {}", peripheral)))?;
        if record.state != ConnectionState::Connected {
            return Err(BluetoothError::InvalidState(format!(
                "can't read the RSSI of {} while {:?}",
                peripheral, record.state
            )));
        }
        self.backend.read_rssi(peripheral)
    }

    fn remove_peripheral(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError> {
        let record = self
            .registry
            .get(peripheral)
            .ok_or_else(|| BluetoothError::NotFound(format!("peripheral {}", peripheral)))?;
        if record.state != ConnectionState::Disconnected {
            return Err(BluetoothError::InvalidState(format!(
                "{} must be disconnected before it is removed",
                peripheral
            )));
        }
        self.registry.remove(peripheral);
        self.subscriptions.remove_peripheral(peripheral);
        self.queues.remove(peripheral);
        debug!("Forgot {}.", peripheral);
        Ok(())
    }

    fn snapshot(&self, peripheral: &PeripheralId) -> Result<PeripheralSnapshot, BluetoothError> {
        let record = self
            .registry
            .get(peripheral)
            .ok_or_else(|| BluetoothError::NotFound(format!("peripheral {}", peripheral)))?;
        Ok(PeripheralSnapshot {
            id: record.id.clone(),
            name: record.name.clone(),
            rssi: record.rssi,
            advertised_services: record.advertised_services.clone(),
            state: record.state,
            max_write_len: record.max_write_len,
            services: record.gatt.services().to_vec(),
            subscriptions: self.subscriptions.entries_for(peripheral),
        })
    }

    /// Checks shared by every application GATT operation before it is
    /// queued.
    fn validate(
        &self,
        peripheral: &PeripheralId,
        kind: &OperationKind,
    ) -> Result<(), BluetoothError> {
        self.ensure_central()?;

        let max = self
            .registry
            .get(peripheral)
            .map_or(self.registry.default_max_write_len(), |r| r.max_write_len);
        if let Some(len) = kind.payload_len() {
            if len > max {
                return Err(BluetoothError::PayloadTooLarge { len, max });
            }
        }

        let record = self
            .registry
            .get(peripheral)
            .ok_or_else(|| BluetoothError::NotFound(format!("peripheral {}", peripheral)))?;
        if record.state != ConnectionState::Connected {
            return Err(BluetoothError::InvalidState(format!(
                "{} needs a connected peripheral, {} is {:?}",
                kind.describe(peripheral),
                peripheral,
                record.state
            )));
        }

        let gatt = &record.gatt;
        let missing = || BluetoothError::NotFound(kind.describe(peripheral));
        match kind {
            OperationKind::ReadCharacteristic {
                service,
                characteristic,
            }
            | OperationKind::WriteCharacteristic {
                service,
                characteristic,
                ..
            }
            | OperationKind::Unsubscribe {
                service,
                characteristic,
            } => gatt
                .characteristic(*service, *characteristic)
                .map(drop)
                .ok_or_else(missing),
            OperationKind::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            }
            | OperationKind::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                ..
            } => gatt
                .descriptor(*service, *characteristic, *descriptor)
                .map(drop)
                .ok_or_else(missing),
            OperationKind::Subscribe {
                service,
                characteristic,
                mode,
            } => {
                let node = gatt
                    .characteristic(*service, *characteristic)
                    .ok_or_else(missing)?;
                if node.properties().supports(*mode) {
                    Ok(())
                } else {
                    Err(BluetoothError::NotSupported(format!(
                        "{:?} on {}/{} of {}",
                        mode, service, characteristic, peripheral
                    )))
                }
            }
            _ => Err(BluetoothError::Internal(String::from(
                "discovery can't be requested directly",
            ))),
        }
    }

    fn enqueue(&mut self, peripheral: PeripheralId, kind: OperationKind, reply: Reply<Vec<u8>>) {
        if let Err(err) = self.validate(&peripheral, &kind) {
            debug!("Rejected {}: {}", kind.describe(&peripheral), err);
            let _ = reply.send(Err(err));
            return;
        }

        if let OperationKind::Unsubscribe {
            service,
            characteristic,
        } = &kind
        {
            self.subscriptions
                .set_active(&peripheral, *service, *characteristic, false);
        }

        let op = PendingOperation::new(
            self.next_operation_id(),
            peripheral.clone(),
            kind,
            Some(reply),
        );
        debug!("Queued {} as {}.", op.describe(), op.id);
        self.queues.entry(peripheral.clone()).or_default().push(op);
        self.pump(&peripheral);
    }

    /// Queue an operation the session issues on its own behalf.
    fn enqueue_internal(&mut self, peripheral: &PeripheralId, kind: OperationKind) {
        let op =
            PendingOperation::new(self.next_operation_id(), peripheral.clone(), kind, None);
        self.queues.entry(peripheral.clone()).or_default().push(op);
    }

    /// Dispatch the head of `peripheral`'s queue unless something is already
    /// in flight.
    fn pump(&mut self, peripheral: &PeripheralId) {
        loop {
            let Some(queue) = self.queues.get_mut(peripheral) else {
                return;
            };
            let Some(head) = queue.head_mut() else {
                self.queues.remove(peripheral);
                return;
            };
            if head.deadline.is_some() {
                return;
            }

            let request = GattRequest {
                op: head.id,
                peripheral: peripheral.clone(),
                kind: head.kind.request(),
            };
            let unacknowledged = head.kind.is_unacknowledged();
            debug!("Dispatching {} ({}).", head.describe(), head.id);

            let outcome = match self.backend.submit(request) {
                Ok(()) if !unacknowledged => {
                    head.deadline = Some(Instant::now() + self.config.operation_timeout());
                    return;
                }
                Ok(()) => Ok(Vec::new()),
                Err(err) => Err(err),
            };
            if let Some(op) = queue.pop_head() {
                self.complete(op, outcome);
            }
        }
    }

    /// Settle an operation that left its queue: retry, update session state
    /// and answer the caller. The caller pumps the queue afterwards.
    fn complete(&mut self, mut op: PendingOperation, result: Result<Vec<u8>, BluetoothError>) {
        if let Err(err) = &result {
            if op.kind.is_discovery()
                && err.is_transient()
                && op.attempts < self.config.discovery_retries
                && self.is_running()
            {
                op.attempts += 1;
                op.deadline = None;
                op.id = self.next_operation_id();
                warn!("Retrying {} as {} after: {}", op.describe(), op.id, err);
                self.queues
                    .entry(op.peripheral.clone())
                    .or_default()
                    .push_front(op);
                return;
            }
            warn!("{} failed: {}", op.describe(), err);
        }

        match &op.kind {
            kind if kind.is_discovery() => {
                self.finish_discovery_step(&op.peripheral, kind, &result)
            }
            OperationKind::Subscribe {
                service,
                characteristic,
                mode,
            } => {
                if result.is_ok() {
                    info!("Subscribed to {}.", op.describe());
                    self.subscriptions
                        .insert(&op.peripheral, *service, *characteristic, *mode);
                    self.dispatcher.emit(SessionEvent::SubscriptionChanged {
                        peripheral: op.peripheral.clone(),
                        service: *service,
                        characteristic: *characteristic,
                        mode: Some(*mode),
                    });
                }
            }
            OperationKind::Unsubscribe {
                service,
                characteristic,
            } => {
                if result.is_ok() {
                    self.subscriptions
                        .remove(&op.peripheral, *service, *characteristic);
                    self.dispatcher.emit(SessionEvent::SubscriptionChanged {
                        peripheral: op.peripheral.clone(),
                        service: *service,
                        characteristic: *characteristic,
                        mode: None,
                    });
                } else {
                    self.subscriptions
                        .set_active(&op.peripheral, *service, *characteristic, true);
                }
            }
            _ => {}
        }

        op.resolve(result);
    }

    fn start_discovery(&mut self, peripheral: &PeripheralId) {
        if let Some(record) = self.registry.get_mut(peripheral) {
            record.gatt.clear();
            record.discovery_steps = 1;
        }
        debug!("Starting discovery on {}.", peripheral);
        self.enqueue_internal(peripheral, OperationKind::DiscoverServices);
        self.pump(peripheral);
    }

    /// Breadth-first: each finished level queues the next one for every
    /// entity found on it.
    fn finish_discovery_step(
        &mut self,
        peripheral: &PeripheralId,
        kind: &OperationKind,
        result: &Result<Vec<u8>, BluetoothError>,
    ) {
        let running = self.is_running();
        let Some(record) = self.registry.get_mut(peripheral) else {
            return;
        };
        record.discovery_steps = record.discovery_steps.saturating_sub(1);

        let children: Vec<OperationKind> = match (kind, result) {
            (_, Err(err)) => {
                self.dispatcher.emit(SessionEvent::Error {
                    peripheral: Some(peripheral.clone()),
                    error: err.clone(),
                });
                Vec::new()
            }
            _ if !running => Vec::new(),
            (OperationKind::DiscoverServices, Ok(_)) => record
                .gatt
                .service_uuids()
                .into_iter()
                .map(|service| OperationKind::DiscoverCharacteristics { service })
                .collect(),
            (OperationKind::DiscoverCharacteristics { service }, Ok(_)) => record
                .gatt
                .characteristic_uuids(*service)
                .into_iter()
                .map(|characteristic| OperationKind::DiscoverDescriptors {
                    service: *service,
                    characteristic,
                })
                .collect(),
            _ => Vec::new(),
        };
        record.discovery_steps += children.len();
        let done = record.discovery_steps == 0;

        for child in children {
            self.enqueue_internal(peripheral, child);
        }
        if done {
            info!("Discovery of {} complete.", peripheral);
            self.dispatcher.emit(SessionEvent::DiscoveryComplete {
                peripheral: peripheral.clone(),
            });
        }
    }

    pub(crate) fn handle_native(&mut self, event: NativeEvent) {
        if matches!(self.lifecycle, Lifecycle::Released) {
            debug!("Session released, ignoring {:?}", event);
            return;
        }

        match event {
            NativeEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            NativeEvent::AdvertisementReceived(adv) => self.on_advertisement(&adv),
            NativeEvent::Connected(peripheral) => self.on_connected(&peripheral),
            NativeEvent::ConnectFailed { peripheral, error } => {
                self.on_connect_failed(&peripheral, error)
            }
            NativeEvent::Disconnected(peripheral) => self.on_disconnected(&peripheral),
            NativeEvent::MtuChanged { peripheral, mtu } => self.on_mtu_changed(&peripheral, mtu),
            NativeEvent::ServiceDiscovered {
                peripheral,
                service,
            } => self.on_service(&peripheral, service),
            NativeEvent::CharacteristicDiscovered {
                peripheral,
                service,
                characteristic,
                properties,
            } => self.on_characteristic(&peripheral, service, characteristic, properties),
            NativeEvent::DescriptorDiscovered {
                peripheral,
                service,
                characteristic,
                descriptor,
            } => self.on_descriptor(&peripheral, service, characteristic, descriptor),
            NativeEvent::GattCompleted {
                peripheral,
                op,
                result,
            } => self.on_gatt_completed(&peripheral, op, result),
            NativeEvent::ValueNotified {
                peripheral,
                service,
                characteristic,
                value,
            } => {
                if !self
                    .subscriptions
                    .is_active(&peripheral, service, characteristic)
                {
                    warn!(
                        "Dropping value of {}/{} from {}: not subscribed.",
                        service, characteristic, peripheral
                    );
                    return;
                }
                self.dispatcher.emit(SessionEvent::Notification {
                    peripheral,
                    service,
                    characteristic,
                    value,
                });
            }
            NativeEvent::RssiRead { peripheral, rssi } => {
                if let Some(record) = self.registry.get_mut(&peripheral) {
                    record.rssi = Some(rssi);
                }
                self.dispatcher
                    .emit(SessionEvent::RssiUpdated { peripheral, rssi });
            }
            NativeEvent::Error(message) => {
                error!("Native stack reported: {}", message);
                self.dispatcher.emit(SessionEvent::Error {
                    peripheral: None,
                    error: BluetoothError::System(message),
                });
            }
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        if state == self.adapter_state {
            return;
        }
        info!("Adapter state {} -> {}.", self.adapter_state, state);
        self.adapter_state = state;
        self.dispatcher
            .emit(SessionEvent::AdapterStateChanged(state));

        if self.ensure_powered().is_err() {
            if self.registry.end_scan() {
                info!("Scan ended, adapter is {}.", state);
            }
            for peripheral in self.registry.linked() {
                self.on_disconnected(&peripheral);
            }
        }
    }

    fn on_advertisement(&mut self, adv: &Advertisement) {
        if let Some(sighting) = self.registry.observe(adv) {
            debug!("Discovered {} ({:?}).", sighting.peripheral, sighting.name);
            self.dispatcher.emit(SessionEvent::PeripheralDiscovered {
                peripheral: sighting.peripheral,
                name: sighting.name,
                rssi: sighting.rssi,
            });
        }
    }

    fn on_connected(&mut self, peripheral: &PeripheralId) {
        let max_write_len = self.registry.default_max_write_len();
        let Some(record) = self.registry.get_mut(peripheral) else {
            warn!("Connection to unknown peripheral {}, ignoring.", peripheral);
            return;
        };
        if record.state != ConnectionState::Connecting {
            warn!(
                "Unexpected connection to {} while {:?}, ignoring.",
                peripheral, record.state
            );
            return;
        }

        info!("Connected to {}.", peripheral);
        record.state = ConnectionState::Connected;
        record.state_deadline = None;
        record.max_write_len = max_write_len;
        let name = record.name.clone();
        if let Some(waiter) = record.connect_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
        self.dispatcher.emit(SessionEvent::Connected {
            peripheral: peripheral.clone(),
            name,
        });
        self.start_discovery(peripheral);
    }

    fn on_connect_failed(&mut self, peripheral: &PeripheralId, error: BluetoothError) {
        let Some(record) = self
            .registry
            .get_mut(peripheral)
            .filter(|r| r.state == ConnectionState::Connecting)
        else {
            debug!("Stale connection failure for {}: {}", peripheral, error);
            return;
        };

        warn!("Connecting to {} failed: {}", peripheral, error);
        record.state = ConnectionState::Disconnected;
        record.state_deadline = None;
        if let Some(waiter) = record.connect_waiter.take() {
            let _ = waiter.send(Err(error.clone()));
        }
        self.dispatcher.emit(SessionEvent::ConnectFailed {
            peripheral: peripheral.clone(),
            error,
        });
        self.check_shutdown();
    }

    /// Tear down everything attached to the link. Queued and in-flight
    /// operations fail with `Disconnected` in FIFO order.
    fn on_disconnected(&mut self, peripheral: &PeripheralId) {
        let Some(record) = self.registry.get_mut(peripheral) else {
            debug!("Disconnection of unknown peripheral {}, ignoring.", peripheral);
            return;
        };
        let previous = record.state;
        if previous == ConnectionState::Disconnected {
            debug!("{} is already disconnected.", peripheral);
            return;
        }

        info!("Disconnected from {} (was {:?}).", peripheral, previous);
        record.state = ConnectionState::Disconnected;
        record.state_deadline = None;
        record.discovery_steps = 0;
        let name = record.name.clone();
        let connect_waiter = record.connect_waiter.take();
        let disconnect_waiters = std::mem::take(&mut record.disconnect_waiters);

        if let Some(mut queue) = self.queues.remove(peripheral) {
            let flushed = queue.drain();
            if !flushed.is_empty() {
                info!("Failing {} pending operations of {}.", flushed.len(), peripheral);
            }
            for op in flushed {
                let reason = op.describe();
                op.resolve(Err(BluetoothError::Disconnected(reason)));
            }
        }
        let dropped = self.subscriptions.remove_peripheral(peripheral);
        if dropped > 0 {
            debug!("Dropped {} subscriptions of {}.", dropped, peripheral);
        }

        if let Some(waiter) = connect_waiter {
            let _ = waiter.send(Err(BluetoothError::Disconnected(format!(
                "connection to {} was lost",
                peripheral
            ))));
        }
        for waiter in disconnect_waiters {
            let _ = waiter.send(Ok(()));
        }

        let event = if previous == ConnectionState::Connecting {
            SessionEvent::ConnectFailed {
                peripheral: peripheral.clone(),
                error: BluetoothError::Disconnected(format!(
                    "connection to {} was lost",
                    peripheral
                )),
            }
        } else {
            SessionEvent::Disconnected {
                peripheral: peripheral.clone(),
                name,
            }
        };
        self.dispatcher.emit(event);

        self.check_shutdown();
        self.check_cleanup();
    }

    fn on_connect_timeout(&mut self, peripheral: &PeripheralId) {
        warn!("Connecting to {} timed out.", peripheral);
        if let Err(err) = self.backend.disconnect(peripheral) {
            warn!("Failed to cancel connection to {}: {}", peripheral, err);
        }
        self.on_connect_failed(
            peripheral,
            BluetoothError::Timeout(format!("connecting to {}", peripheral)),
        );
    }

    fn on_mtu_changed(&mut self, peripheral: &PeripheralId, mtu: u16) {
        // Three bytes of every ATT write are header.
        let max_write_len = usize::from(mtu).saturating_sub(3);
        match self.registry.get_mut(peripheral) {
            Some(record) if max_write_len > 0 => {
                debug!("{} accepts writes of up to {} bytes.", peripheral, max_write_len);
                record.max_write_len = max_write_len;
            }
            _ => debug!("Ignoring MTU {} for {}.", mtu, peripheral),
        }
    }

    fn on_service(&mut self, peripheral: &PeripheralId, service: BleUuid) {
        let Some(record) = self
            .registry
            .get_mut(peripheral)
            .filter(|r| r.state == ConnectionState::Connected)
        else {
            debug!("Dropping service {} of {}: not connected.", service, peripheral);
            return;
        };
        if record.gatt.add_service(service) {
            self.dispatcher.emit(SessionEvent::ServiceDiscovered {
                peripheral: peripheral.clone(),
                service,
            });
        }
    }

    fn on_characteristic(
        &mut self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        properties: CharacteristicProperties,
    ) {
        let Some(record) = self
            .registry
            .get_mut(peripheral)
            .filter(|r| r.state == ConnectionState::Connected)
        else {
            debug!("Dropping characteristic {} of {}: not connected.", characteristic, peripheral);
            return;
        };
        match record.gatt.add_characteristic(service, characteristic, properties) {
            Some(true) => self.dispatcher.emit(SessionEvent::CharacteristicDiscovered {
                peripheral: peripheral.clone(),
                service,
                characteristic,
                properties,
            }),
            Some(false) => {}
            None => warn!(
                "Characteristic {} of {} belongs to unknown service {}.",
                characteristic, peripheral, service
            ),
        }
    }

    fn on_descriptor(
        &mut self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) {
        let Some(record) = self
            .registry
            .get_mut(peripheral)
            .filter(|r| r.state == ConnectionState::Connected)
        else {
            debug!("Dropping descriptor {} of {}: not connected.", descriptor, peripheral);
            return;
        };
        match record.gatt.add_descriptor(service, characteristic, descriptor) {
            Some(true) => self.dispatcher.emit(SessionEvent::DescriptorDiscovered {
                peripheral: peripheral.clone(),
                service,
                characteristic,
                descriptor,
            }),
            Some(false) => {}
            None => warn!(
                "Descriptor {} of {} belongs to unknown characteristic {}/{}.",
                descriptor, peripheral, service, characteristic
            ),
        }
    }

    fn on_gatt_completed(
        &mut self,
        peripheral: &PeripheralId,
        id: OperationId,
        result: Result<Vec<u8>, BluetoothError>,
    ) {
        let Some(op) = self
            .queues
            .get_mut(peripheral)
            .and_then(|queue| queue.pop_completed(id))
        else {
            debug!("Ignoring stale completion {} from {}.", id, peripheral);
            return;
        };
        self.complete(op, result);
        self.pump(peripheral);
        self.check_cleanup();
    }

    /// Stop scanning and disconnect everything. The reply is sent once no
    /// peripheral is linked anymore.
    fn shutdown(&mut self, reply: Reply<()>) {
        info!("Shutting down.");
        if self.registry.end_scan() {
            if let Err(err) = self.backend.stop_scan() {
                warn!("Failed to stop scanning: {}", err);
            }
        }

        let deadline = Instant::now() + self.config.connect_timeout();
        for peripheral in self.registry.linked() {
            let pending = self
                .registry
                .get(&peripheral)
                .map_or(false, |r| r.state != ConnectionState::Disconnecting);
            if !pending {
                continue;
            }
            match self.backend.disconnect(&peripheral) {
                Ok(()) => {
                    if let Some(record) = self.registry.get_mut(&peripheral) {
                        record.state = ConnectionState::Disconnecting;
                        record.state_deadline = Some(deadline);
                    }
                }
                Err(err) => {
                    warn!("Failed to disconnect from {}, dropping it: {}", peripheral, err);
                    self.on_disconnected(&peripheral);
                }
            }
        }

        self.shutdown_waiters.push(reply);
        self.check_shutdown();
    }

    fn check_shutdown(&mut self) {
        if self.shutdown_waiters.is_empty() || !self.registry.linked().is_empty() {
            return;
        }

        info!("All peripherals disconnected, clearing the session.");
        self.registry.clear();
        self.subscriptions.clear();
        for op in self.queues.drain().flat_map(|(_, mut queue)| queue.drain()) {
            op.resolve(Err(BluetoothError::AdapterUnavailable));
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn cleanup(&mut self, reply: Reply<()>) {
        if !self.is_running() {
            let _ = reply.send(Err(BluetoothError::AlreadyCleanedUp));
            return;
        }

        info!("Cleaning up the session.");
        if self.registry.end_scan() {
            if let Err(err) = self.backend.stop_scan() {
                warn!("Failed to stop scanning: {}", err);
            }
        }
        for queue in self.queues.values_mut() {
            for op in queue.drain_waiting() {
                op.resolve(Err(BluetoothError::AdapterUnavailable));
            }
        }
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(Err(BluetoothError::AdapterUnavailable));
        }
        for (_, pending) in self.retrievals.drain() {
            let _ = pending.reply.send(Err(BluetoothError::AdapterUnavailable));
        }

        self.lifecycle = Lifecycle::CleaningUp(reply);
        self.check_cleanup();
    }

    /// Release the backend once cleanup was requested and nothing is in
    /// flight anymore.
    fn check_cleanup(&mut self) {
        if !matches!(self.lifecycle, Lifecycle::CleaningUp(_)) {
            return;
        }
        if self.queues.values().any(|queue| !queue.is_empty()) {
            debug!("Cleanup waits for in-flight operations.");
            return;
        }
        let Lifecycle::CleaningUp(reply) =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Released)
        else {
            return;
        };

        let result = self.backend.release();
        self.registry.clear();
        self.subscriptions.clear();
        self.queues.clear();
        info!("Session released.");
        let _ = reply.send(result);
    }

    /// Fail everything whose deadline passed by `now`.
    pub(crate) fn expire(&mut self, now: Instant) {
        let mut stale_links: Vec<(PeripheralId, ConnectionState)> = self
            .registry
            .records()
            .filter(|r| r.state_deadline.map_or(false, |deadline| deadline <= now))
            .map(|r| (r.id.clone(), r.state))
            .collect();
        stale_links.sort_by(|a, b| a.0.cmp(&b.0));
        for (peripheral, state) in stale_links {
            match state {
                ConnectionState::Connecting => self.on_connect_timeout(&peripheral),
                ConnectionState::Disconnecting => {
                    warn!("{} didn't confirm the disconnection, forcing it.", peripheral);
                    self.on_disconnected(&peripheral);
                }
                _ => {}
            }
        }

        let mut expired: Vec<PeripheralId> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue
                    .in_flight()
                    .and_then(|op| op.deadline)
                    .map_or(false, |deadline| deadline <= now)
            })
            .map(|(peripheral, _)| peripheral.clone())
            .collect();
        expired.sort();
        for peripheral in expired {
            let Some(op) = self
                .queues
                .get_mut(&peripheral)
                .and_then(|queue| queue.pop_head())
            else {
                continue;
            };
            let reason = op.describe();
            warn!("{} timed out.", reason);
            self.complete(op, Err(BluetoothError::Timeout(reason)));
            self.pump(&peripheral);
        }

        let mut lookups: Vec<OperationId> = self
            .retrievals
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        lookups.sort();
        for id in lookups {
            if let Some(pending) = self.retrievals.remove(&id) {
                warn!("Lookup {} timed out.", id);
                let _ = pending
                    .reply
                    .send(Err(BluetoothError::Timeout(format!("lookup {}", id))));
            }
        }

        self.check_cleanup();
    }

    /// Earliest connection, operation or lookup deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let links = self.registry.records().filter_map(|r| r.state_deadline);
        let operations = self
            .queues
            .values()
            .filter_map(|queue| queue.in_flight().and_then(|op| op.deadline));
        let lookups = self.retrievals.values().map(|pending| pending.deadline);
        links.chain(operations).chain(lookups).min()
    }
}
