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

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::sync::mpsc;

use crate::common::{
    AdapterState, BleUuid, BluetoothError, CharacteristicProperties,
    PeripheralId, SubscriptionMode,
};

/// Application-facing events. Events about one peripheral arrive in the
/// order the native stack emitted them.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// The native adapter was started.
    Ready,
    /// An error that isn't the answer to a specific request.
    Error {
        peripheral: Option<PeripheralId>,
        error: BluetoothError,
    },
    AdapterStateChanged(AdapterState),
    /// Answer to `Session::read_rssi()`; every RSSI read shares this event.
    RssiUpdated {
        peripheral: PeripheralId,
        rssi: i16,
    },
    PeripheralDiscovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    Connected {
        peripheral: PeripheralId,
        name: Option<String>,
    },
    ConnectFailed {
        peripheral: PeripheralId,
        error: BluetoothError,
    },
    Disconnected {
        peripheral: PeripheralId,
        name: Option<String>,
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
    /// Every discovery step for the peripheral has finished, successfully or
    /// not.
    DiscoveryComplete {
        peripheral: PeripheralId,
    },
    /// `mode` is `None` once the subscription is gone.
    SubscriptionChanged {
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        mode: Option<SubscriptionMode>,
    },
    Notification {
        peripheral: PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        value: Vec<u8>,
    },
}

impl SessionEvent {
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            SessionEvent::Ready | SessionEvent::AdapterStateChanged(_) => None,
            SessionEvent::Error { peripheral, .. } => peripheral.as_ref(),
            SessionEvent::RssiUpdated { peripheral, .. }
            | SessionEvent::PeripheralDiscovered { peripheral, .. }
            | SessionEvent::Connected { peripheral, .. }
            | SessionEvent::ConnectFailed { peripheral, .. }
            | SessionEvent::Disconnected { peripheral, .. }
            | SessionEvent::ServiceDiscovered { peripheral, .. }
            | SessionEvent::CharacteristicDiscovered { peripheral, .. }
            | SessionEvent::DescriptorDiscovered { peripheral, .. }
            | SessionEvent::DiscoveryComplete { peripheral }
            | SessionEvent::SubscriptionChanged { peripheral, .. }
            | SessionEvent::Notification { peripheral, .. } => Some(peripheral),
        }
    }

    /// Scan results and notifications, the events a paused session may
    /// discard.
    pub(crate) fn is_suspendable(&self) -> bool {
        matches!(
            self,
            SessionEvent::PeripheralDiscovered { .. } | SessionEvent::Notification { .. }
        )
    }
}

/// Ordered stream of `SessionEvent`s returned by `Session::startup()`. Ends
/// once the session engine stops.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        EventStream { receiver }
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
