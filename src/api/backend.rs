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

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use super::NativeEventSender;
use crate::common::{BleUuid, BluetoothError, PeripheralId, Role};

/// Correlates a GATT request with the native completion that answers it.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// A single GATT transaction handed to the native stack. The session never
/// has more than one of these outstanding per peripheral.
#[derive(Clone, Debug, PartialEq)]
pub struct GattRequest {
    pub op: OperationId,
    pub peripheral: PeripheralId,
    pub kind: GattRequestKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GattRequestKind {
    DiscoverServices,
    DiscoverCharacteristics {
        service: BleUuid,
    },
    DiscoverDescriptors {
        service: BleUuid,
        characteristic: BleUuid,
    },
    ReadCharacteristic {
        service: BleUuid,
        characteristic: BleUuid,
    },
    /// Writes without response are never answered with a completion.
    WriteCharacteristic {
        service: BleUuid,
        characteristic: BleUuid,
        value: Vec<u8>,
        with_response: bool,
    },
    ReadDescriptor {
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    },
    WriteDescriptor {
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
        value: Vec<u8>,
    },
}

/// Which already-known peripherals to enumerate without scanning.
#[derive(Clone, Debug, PartialEq)]
pub enum PeripheralQuery {
    /// Peripherals connected to the system that expose any of the services,
    /// or all of them when `None`.
    ConnectedWithServices(Option<Vec<BleUuid>>),
    /// Peripherals the system remembers under these identifiers.
    Identifiers(Vec<PeripheralId>),
}

/// A peripheral returned by a `PeripheralQuery`.
#[derive(Clone, Debug, PartialEq)]
pub struct KnownPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
}

/// Concrete types implementing this trait bind the session to a native BLE
/// stack. Every method only *issues* a request: results come back later as
/// `NativeEvent`s through the sender handed over in `start()`, from whatever
/// thread the platform delivers them on.
pub trait BleBackend: Send + 'static {
    /// Bring up the native adapter in `role` and keep `events` for reporting.
    fn start(
        &mut self,
        role: Role,
        events: NativeEventSender,
    ) -> Result<(), BluetoothError>;

    /// Begin scanning for nearby advertisements. Called again while scanning
    /// only after `stop_scan()`.
    fn start_scan(
        &mut self,
        services: Option<&[BleUuid]>,
    ) -> Result<(), BluetoothError>;

    /// Stop scanning for nearby advertisements.
    fn stop_scan(&mut self) -> Result<(), BluetoothError>;

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError>;

    fn disconnect(
        &mut self,
        peripheral: &PeripheralId,
    ) -> Result<(), BluetoothError>;

    /// Issue a GATT transaction. Answered by `NativeEvent::GattCompleted`
    /// carrying `request.op`, except for writes without response.
    fn submit(&mut self, request: GattRequest) -> Result<(), BluetoothError>;

    /// Answered by `NativeEvent::RssiRead`.
    fn read_rssi(&mut self, peripheral: &PeripheralId) -> Result<(), BluetoothError>;

    /// Lookup of peripherals the platform already knows about. Platforms
    /// that can only find devices by scanning keep the default.
    fn directory(&self) -> Option<Arc<dyn PeripheralDirectory>> {
        None
    }

    /// Release every native resource acquired in `start()`. The backend must
    /// drop its `NativeEventSender` here.
    fn release(&mut self) -> Result<(), BluetoothError>;
}

/// Enumerates peripherals without scanning. Queries run on their own task,
/// so a slow platform lookup never holds up the session.
#[async_trait]
pub trait PeripheralDirectory: Send + Sync + 'static {
    async fn retrieve(
        &self,
        query: &PeripheralQuery,
    ) -> Result<Vec<KnownPeripheral>, BluetoothError>;
}
