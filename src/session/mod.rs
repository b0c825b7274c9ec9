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

//! The session engine. A single task owns every registry, cache and queue;
//! application commands and native events reach it through one inbox, so
//! no state is ever touched from two places at once.

mod dispatcher;
mod events;
mod gatt;
mod manager;
mod queue;
mod registry;
mod subscriptions;

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::{debug, info};

pub use events::{EventStream, SessionEvent};
pub use gatt::{CharacteristicNode, DescriptorNode, ServiceNode};
pub use registry::PeripheralSnapshot;
pub use subscriptions::SubscriptionEntry;

use self::{manager::SessionManager, queue::OperationKind};
use crate::{
    api::{
        BleBackend, KnownPeripheral, NativeEvent, NativeEventSender,
        OperationId, PeripheralQuery,
    },
    common::{
        AdapterState, BleUuid, BluetoothError, PeripheralId, Role,
        SessionConfig, SubscriptionMode,
    },
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, BluetoothError>>;

/// Everything the engine consumes, in arrival order.
pub(crate) enum Inbox {
    Command(Command),
    Native(NativeEvent),
    /// A directory lookup started by `Command::Retrieve` finished.
    Retrieved {
        id: OperationId,
        result: Result<Vec<KnownPeripheral>, BluetoothError>,
    },
}

pub(crate) enum Command {
    Shutdown(Reply<()>),
    Cleanup(Reply<()>),
    Pause {
        paused: bool,
        reply: Reply<()>,
    },
    Scan {
        services: Option<Vec<BleUuid>>,
        reply: Reply<()>,
    },
    StopScan(Reply<()>),
    Connect {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
    Disconnect {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
    Retrieve {
        query: PeripheralQuery,
        reply: Reply<Vec<KnownPeripheral>>,
    },
    Gatt {
        peripheral: PeripheralId,
        operation: OperationKind,
        reply: Reply<Vec<u8>>,
    },
    ReadRssi {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
    RemovePeripheral {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
    AdapterState(Reply<AdapterState>),
    Inspect {
        peripheral: PeripheralId,
        reply: Reply<PeripheralSnapshot>,
    },
}

impl Command {
    /// Fails with `InvalidArgument` when the command names an empty
    /// peripheral identifier.
    pub(crate) fn check_identifiers(&self) -> Result<(), BluetoothError> {
        let ids: &[PeripheralId] = match self {
            Command::Connect { peripheral, .. }
            | Command::Disconnect { peripheral, .. }
            | Command::Gatt { peripheral, .. }
            | Command::ReadRssi { peripheral, .. }
            | Command::RemovePeripheral { peripheral, .. }
            | Command::Inspect { peripheral, .. } => std::slice::from_ref(peripheral),
            Command::Retrieve {
                query: PeripheralQuery::Identifiers(ids),
                ..
            } => ids,
            _ => &[],
        };
        if ids.iter().any(PeripheralId::is_empty) {
            return Err(BluetoothError::InvalidArgument(String::from(
                "empty peripheral identifier",
            )));
        }
        Ok(())
    }

    /// Answer the command with `err` without executing it.
    pub(crate) fn reject(self, err: BluetoothError) {
        // Callers that stopped waiting don't care about the answer.
        match self {
            Command::Shutdown(reply)
            | Command::Cleanup(reply)
            | Command::Pause { reply, .. }
            | Command::Scan { reply, .. }
            | Command::StopScan(reply)
            | Command::Connect { reply, .. }
            | Command::Disconnect { reply, .. }
            | Command::ReadRssi { reply, .. }
            | Command::RemovePeripheral { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Retrieve { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Gatt { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::AdapterState(reply) => {
                let _ = reply.send(Err(err));
            }
            Command::Inspect { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Handle to a running BLE central session. Cheap to clone; every clone
/// talks to the same engine. Dropping all handles (and the backend's event
/// sender) stops the engine.
#[derive(Clone, Debug)]
pub struct Session {
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl Session {
    /// Start `backend` in `role` and spawn the session engine on the current
    /// tokio runtime. Adapter state, RSSI updates and every other
    /// application event arrive on the returned stream, starting with
    /// `SessionEvent::Ready`.
    pub fn startup(
        backend: Box<dyn BleBackend>,
        role: Role,
        config: SessionConfig,
    ) -> Result<(Session, EventStream), BluetoothError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BluetoothError::InvalidState(String::from(
                "startup must be called from within a tokio runtime",
            ))
        })?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut manager = SessionManager::new(backend, role, config, event_tx);
        manager.start(NativeEventSender::new(inbox_tx.clone()))?;

        let engine = Engine {
            manager,
            inbox: inbox_rx,
        };
        runtime.spawn(engine.run());

        Ok((Session { inbox: inbox_tx }, EventStream::new(event_rx)))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, BluetoothError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Inbox::Command(command(reply)))
            .map_err(|_| BluetoothError::AdapterUnavailable)?;
        response
            .await
            .map_err(|_| BluetoothError::AdapterUnavailable)?
    }

    /// Stop scanning and disconnect every peripheral. Resolves once all of
    /// them are disconnected; the registry is emptied afterwards.
    pub async fn shutdown(&self) -> Result<(), BluetoothError> {
        self.request(Command::Shutdown).await
    }

    /// One-time teardown. Waits for in-flight operations to resolve, fails
    /// the ones still queued and releases the native resources. Fails with
    /// `AlreadyCleanedUp` when called again.
    pub async fn cleanup(&self) -> Result<(), BluetoothError> {
        self.request(Command::Cleanup).await
    }

    /// Blocking flavour of `cleanup()` for callers outside of async code.
    /// Must not be called from within the runtime driving the session.
    pub fn blocking_cleanup(&self) -> Result<(), BluetoothError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Inbox::Command(Command::Cleanup(reply)))
            .map_err(|_| BluetoothError::AdapterUnavailable)?;
        response
            .blocking_recv()
            .map_err(|_| BluetoothError::AdapterUnavailable)?
    }

    /// Suspend or resume event delivery. Connections stay up.
    pub async fn pause(&self, paused: bool) -> Result<(), BluetoothError> {
        self.request(|reply| Command::Pause { paused, reply }).await
    }

    /// Scan for peripherals advertising any of `services`, or all
    /// peripherals when `None`. Restarts an active scan.
    pub async fn scan(
        &self,
        services: Option<Vec<BleUuid>>,
    ) -> Result<(), BluetoothError> {
        self.request(|reply| Command::Scan { services, reply }).await
    }

    /// Safe to call without an active scan.
    pub async fn stop_scan(&self) -> Result<(), BluetoothError> {
        self.request(Command::StopScan).await
    }

    /// Resolves once the peripheral is connected. Service discovery starts
    /// right after and is reported on the event stream.
    pub async fn connect(&self, peripheral: PeripheralId) -> Result<(), BluetoothError> {
        self.request(|reply| Command::Connect { peripheral, reply })
            .await
    }

    /// Resolves once the native stack confirms the disconnection.
    pub async fn disconnect(
        &self,
        peripheral: PeripheralId,
    ) -> Result<(), BluetoothError> {
        self.request(|reply| Command::Disconnect { peripheral, reply })
            .await
    }

    /// Peripherals connected to the system that expose any of `services`,
    /// without scanning.
    pub async fn retrieve_connected(
        &self,
        services: Option<Vec<BleUuid>>,
    ) -> Result<Vec<KnownPeripheral>, BluetoothError> {
        let query = PeripheralQuery::ConnectedWithServices(services);
        self.request(|reply| Command::Retrieve { query, reply }).await
    }

    /// Peripherals the system remembers under `ids`, without scanning.
    pub async fn retrieve_known(
        &self,
        ids: Vec<PeripheralId>,
    ) -> Result<Vec<KnownPeripheral>, BluetoothError> {
        let query = PeripheralQuery::Identifiers(ids);
        self.request(|reply| Command::Retrieve { query, reply }).await
    }

    async fn gatt(
        &self,
        peripheral: PeripheralId,
        operation: OperationKind,
    ) -> Result<Vec<u8>, BluetoothError> {
        self.request(|reply| Command::Gatt {
            peripheral,
            operation,
            reply,
        })
        .await
    }

    /// Enable notifications or indications. Values arrive as
    /// `SessionEvent::Notification`.
    pub async fn subscribe(
        &self,
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        mode: SubscriptionMode,
    ) -> Result<(), BluetoothError> {
        self.gatt(
            peripheral,
            OperationKind::Subscribe {
                service,
                characteristic,
                mode,
            },
        )
        .await
        .map(drop)
    }

    pub async fn unsubscribe(
        &self,
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<(), BluetoothError> {
        self.gatt(
            peripheral,
            OperationKind::Unsubscribe {
                service,
                characteristic,
            },
        )
        .await
        .map(drop)
    }

    pub async fn read_characteristic(
        &self,
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Result<Vec<u8>, BluetoothError> {
        self.gatt(
            peripheral,
            OperationKind::ReadCharacteristic {
                service,
                characteristic,
            },
        )
        .await
    }

    /// Writes longer than the link's maximum payload fail with
    /// `PayloadTooLarge`. Without response, resolves as soon as the native
    /// stack accepted the write.
    pub async fn write_characteristic(
        &self,
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        value: Vec<u8>,
        with_response: bool,
    ) -> Result<(), BluetoothError> {
        self.gatt(
            peripheral,
            OperationKind::WriteCharacteristic {
                service,
                characteristic,
                value,
                with_response,
            },
        )
        .await
        .map(drop)
    }

    pub async fn read_descriptor(
        &self,
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Result<Vec<u8>, BluetoothError> {
        self.gatt(
            peripheral,
            OperationKind::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            },
        )
        .await
    }

    pub async fn write_descriptor(
        &self,
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
        value: Vec<u8>,
    ) -> Result<(), BluetoothError> {
        self.gatt(
            peripheral,
            OperationKind::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                value,
            },
        )
        .await
        .map(drop)
    }

    /// Ask for a fresh RSSI value. The value is only reported through
    /// `SessionEvent::RssiUpdated`.
    pub async fn read_rssi(&self, peripheral: PeripheralId) -> Result<(), BluetoothError> {
        self.request(|reply| Command::ReadRssi { peripheral, reply })
            .await
    }

    /// Forget a disconnected peripheral.
    pub async fn remove_peripheral(
        &self,
        peripheral: PeripheralId,
    ) -> Result<(), BluetoothError> {
        self.request(|reply| Command::RemovePeripheral { peripheral, reply })
            .await
    }

    pub async fn adapter_state(&self) -> Result<AdapterState, BluetoothError> {
        self.request(Command::AdapterState).await
    }

    pub async fn peripheral(
        &self,
        peripheral: PeripheralId,
    ) -> Result<PeripheralSnapshot, BluetoothError> {
        self.request(|reply| Command::Inspect { peripheral, reply })
            .await
    }
}

/// Single writer over the session state.
struct Engine {
    manager: SessionManager,
    inbox: mpsc::UnboundedReceiver<Inbox>,
}

impl Engine {
    async fn run(mut self) {
        info!("Session engine started.");
        loop {
            let message = match self.manager.next_deadline() {
                Some(deadline) => tokio::select! {
                    message = self.inbox.recv() => message,
                    _ = time::sleep_until(deadline) => {
                        self.manager.expire(Instant::now());
                        continue;
                    }
                },
                None => self.inbox.recv().await,
            };

            match message {
                Some(Inbox::Command(command)) => self.manager.handle_command(command),
                Some(Inbox::Native(event)) => {
                    debug!("Native event: {:?}", event);
                    self.manager.handle_native(event)
                }
                Some(Inbox::Retrieved { id, result }) => self.manager.on_retrieved(id, result),
                None => break,
            }
        }
        info!("Session engine stopped.");
    }
}
