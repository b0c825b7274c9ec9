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

use tokio::sync::mpsc;
use tracing::error;

use super::OperationId;
use crate::{
    common::{
        AdapterState, Advertisement, BleUuid, BluetoothError,
        CharacteristicProperties, PeripheralId,
    },
    session::Inbox,
};

/// Everything a native BLE stack can report back to the session.
#[derive(Clone, Debug, PartialEq)]
pub enum NativeEvent {
    AdapterStateChanged(AdapterState),
    AdvertisementReceived(Advertisement),
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        error: BluetoothError,
    },
    Disconnected(PeripheralId),
    /// The link's ATT MTU was (re)negotiated.
    MtuChanged {
        peripheral: PeripheralId,
        mtu: u16,
    },
    ServiceDiscovered {
        peripheral: PeripheralId,
        service: BleUuid,
    },
    CharacteristicDiscovered {
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        properties: CharacteristicProperties,
    },
    DescriptorDiscovered {
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    },
    /// Answer to a `GattRequest`. Reads carry the value; everything else an
    /// empty vector.
    GattCompleted {
        peripheral: PeripheralId,
        op: OperationId,
        result: Result<Vec<u8>, BluetoothError>,
    },
    /// Unsolicited value from a notification or indication.
    ValueNotified {
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        value: Vec<u8>,
    },
    RssiRead {
        peripheral: PeripheralId,
        rssi: i16,
    },
    /// Error reported by the native layer that isn't tied to a request.
    Error(String),
}

/// Handle native callbacks use to feed events into the session. Cheap to
/// clone and safe to use from any thread; events from one thread keep their
/// order.
#[derive(Clone, Debug)]
pub struct NativeEventSender {
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl NativeEventSender {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<Inbox>) -> Self {
        NativeEventSender { inbox }
    }

    /// Inbox handle that doesn't keep the session engine alive.
    pub(crate) fn downgrade(&self) -> mpsc::WeakUnboundedSender<Inbox> {
        self.inbox.downgrade()
    }

    /// Queue `event` for the session. Fails once the session is gone.
    pub fn send(&self, event: NativeEvent) -> Result<(), BluetoothError> {
        self.inbox.send(Inbox::Native(event)).map_err(|_| {
            error!("Session is gone, dropping native event.");
            BluetoothError::AdapterUnavailable
        })
    }
}
