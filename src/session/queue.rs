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

use std::collections::VecDeque;

use tokio::time::Instant;

use super::Reply;
use crate::{
    api::{GattRequestKind, OperationId},
    common::{BleUuid, BluetoothError, PeripheralId, SubscriptionMode},
};

/// What a queued operation does. Subscriptions travel to the native stack as
/// writes of the Client Characteristic Configuration descriptor.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum OperationKind {
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
    Subscribe {
        service: BleUuid,
        characteristic: BleUuid,
        mode: SubscriptionMode,
    },
    Unsubscribe {
        service: BleUuid,
        characteristic: BleUuid,
    },
}

impl OperationKind {
    pub(crate) fn is_discovery(&self) -> bool {
        matches!(
            self,
            OperationKind::DiscoverServices
                | OperationKind::DiscoverCharacteristics { .. }
                | OperationKind::DiscoverDescriptors { .. }
        )
    }

    /// Completes as soon as the native stack accepted it.
    pub(crate) fn is_unacknowledged(&self) -> bool {
        matches!(
            self,
            OperationKind::WriteCharacteristic {
                with_response: false,
                ..
            }
        )
    }

    /// Bytes this operation puts on the air, if it writes.
    pub(crate) fn payload_len(&self) -> Option<usize> {
        match self {
            OperationKind::WriteCharacteristic { value, .. }
            | OperationKind::WriteDescriptor { value, .. } => Some(value.len()),
            _ => None,
        }
    }

    pub(crate) fn request(&self) -> GattRequestKind {
        match self {
            OperationKind::DiscoverServices => GattRequestKind::DiscoverServices,
            OperationKind::DiscoverCharacteristics { service } => {
                GattRequestKind::DiscoverCharacteristics { service: *service }
            }
            OperationKind::DiscoverDescriptors {
                service,
                characteristic,
            } => GattRequestKind::DiscoverDescriptors {
                service: *service,
                characteristic: *characteristic,
            },
            OperationKind::ReadCharacteristic {
                service,
                characteristic,
            } => GattRequestKind::ReadCharacteristic {
                service: *service,
                characteristic: *characteristic,
            },
            OperationKind::WriteCharacteristic {
                service,
                characteristic,
                value,
                with_response,
            } => GattRequestKind::WriteCharacteristic {
                service: *service,
                characteristic: *characteristic,
                value: value.clone(),
                with_response: *with_response,
            },
            OperationKind::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            } => GattRequestKind::ReadDescriptor {
                service: *service,
                characteristic: *characteristic,
                descriptor: *descriptor,
            },
            OperationKind::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                value,
            } => GattRequestKind::WriteDescriptor {
                service: *service,
                characteristic: *characteristic,
                descriptor: *descriptor,
                value: value.clone(),
            },
            OperationKind::Subscribe {
                service,
                characteristic,
                mode,
            } => GattRequestKind::WriteDescriptor {
                service: *service,
                characteristic: *characteristic,
                descriptor: BleUuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
                value: mode.cccd_value().to_vec(),
            },
            OperationKind::Unsubscribe {
                service,
                characteristic,
            } => GattRequestKind::WriteDescriptor {
                service: *service,
                characteristic: *characteristic,
                descriptor: BleUuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
                value: vec![0x00, 0x00],
            },
        }
    }

    /// Human readable target used in error messages and logs.
    pub(crate) fn describe(&self, peripheral: &PeripheralId) -> String {
        match self {
            OperationKind::DiscoverServices => {
                format!("service discovery on {}", peripheral)
            }
            OperationKind::DiscoverCharacteristics { service } => format!(
                "characteristic discovery of service {} on {}",
                service, peripheral
            ),
            OperationKind::DiscoverDescriptors {
                service,
                characteristic,
            } => format!(
                "descriptor discovery of characteristic {}/{} on {}",
                service, characteristic, peripheral
            ),
            OperationKind::ReadCharacteristic {
                service,
                characteristic,
            } => format!(
                "read of characteristic {}/{} on {}",
                service, characteristic, peripheral
            ),
            OperationKind::WriteCharacteristic {
                service,
                characteristic,
                ..
            } => format!(
                "write of characteristic {}/{} on {}",
                service, characteristic, peripheral
            ),
            OperationKind::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            } => format!(
                "read of descriptor {}/{}/{} on {}",
                service, characteristic, descriptor, peripheral
            ),
            OperationKind::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                ..
            } => format!(
                "write of descriptor {}/{}/{} on {}",
                service, characteristic, descriptor, peripheral
            ),
            OperationKind::Subscribe {
                service,
                characteristic,
                ..
            } => format!(
                "subscription to {}/{} on {}",
                service, characteristic, peripheral
            ),
            OperationKind::Unsubscribe {
                service,
                characteristic,
            } => format!(
                "unsubscription from {}/{} on {}",
                service, characteristic, peripheral
            ),
        }
    }
}

/// An operation waiting in, or at the head of, a peripheral's queue.
#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub(crate) id: OperationId,
    pub(crate) peripheral: PeripheralId,
    pub(crate) kind: OperationKind,
    /// Automatic retries spent so far.
    pub(crate) attempts: u32,
    /// Set while the operation is in flight.
    pub(crate) deadline: Option<Instant>,
    reply: Option<Reply<Vec<u8>>>,
}

impl PendingOperation {
    pub(crate) fn new(
        id: OperationId,
        peripheral: PeripheralId,
        kind: OperationKind,
        reply: Option<Reply<Vec<u8>>>,
    ) -> Self {
        PendingOperation {
            id,
            peripheral,
            kind,
            attempts: 0,
            deadline: None,
            reply,
        }
    }

    pub(crate) fn describe(&self) -> String {
        self.kind.describe(&self.peripheral)
    }

    /// Hand the outcome to whoever is waiting. Internal operations have no
    /// one waiting.
    pub(crate) fn resolve(mut self, result: Result<Vec<u8>, BluetoothError>) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting; that's fine.
            let _ = reply.send(result);
        }
    }
}

/// FIFO of one peripheral's GATT operations. Only the head can be in flight.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    ops: VecDeque<PendingOperation>,
}

impl OperationQueue {
    pub(crate) fn push(&mut self, op: PendingOperation) {
        self.ops.push_back(op);
    }

    /// Put a retried operation back at the head.
    pub(crate) fn push_front(&mut self, op: PendingOperation) {
        self.ops.push_front(op);
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut PendingOperation> {
        self.ops.front_mut()
    }

    pub(crate) fn in_flight(&self) -> Option<&PendingOperation> {
        self.ops.front().filter(|op| op.deadline.is_some())
    }

    pub(crate) fn pop_head(&mut self) -> Option<PendingOperation> {
        self.ops.pop_front()
    }

    /// Pop the head if it is the in-flight operation `id`. Anything else is a
    /// stale completion.
    pub(crate) fn pop_completed(&mut self, id: OperationId) -> Option<PendingOperation> {
        match self.in_flight() {
            Some(head) if head.id == id => self.ops.pop_front(),
            _ => None,
        }
    }

    /// Remove every operation, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<PendingOperation> {
        self.ops.drain(..).collect()
    }

    /// Remove every operation that hasn't been dispatched yet, oldest first.
    pub(crate) fn drain_waiting(&mut self) -> Vec<PendingOperation> {
        let skip = usize::from(self.in_flight().is_some());
        self.ops.drain(skip..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const SERVICE: BleUuid = BleUuid::from_u16(0x180D);
    const MEASUREMENT: BleUuid = BleUuid::from_u16(0x2A37);

    fn read(id: u64) -> PendingOperation {
        PendingOperation::new(
            OperationId(id),
            PeripheralId::from("A"),
            OperationKind::ReadCharacteristic {
                service: SERVICE,
                characteristic: MEASUREMENT,
            },
            None,
        )
    }

    #[test]
    fn only_the_dispatched_head_completes() {
        let mut queue = OperationQueue::default();
        queue.push(read(1));
        queue.push(read(2));

        // Nothing dispatched yet.
        assert!(queue.in_flight().is_none());
        assert!(queue.pop_completed(OperationId(1)).is_none());

        queue.head_mut().unwrap().deadline = Some(Instant::now() + Duration::from_secs(1));
        assert!(queue.pop_completed(OperationId(2)).is_none());
        assert_eq!(queue.pop_completed(OperationId(1)).unwrap().id, OperationId(1));
        assert_eq!(queue.ops.len(), 1);
    }

    #[test]
    fn drain_waiting_keeps_in_flight_head() {
        let mut queue = OperationQueue::default();
        queue.push(read(1));
        queue.push(read(2));
        queue.push(read(3));
        queue.head_mut().unwrap().deadline = Some(Instant::now());

        let waiting: Vec<_> = queue.drain_waiting().into_iter().map(|op| op.id).collect();
        assert_eq!(waiting, vec![OperationId(2), OperationId(3)]);
        assert_eq!(queue.in_flight().unwrap().id, OperationId(1));

        let all: Vec<_> = queue.drain().into_iter().map(|op| op.id).collect();
        assert_eq!(all, vec![OperationId(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn resolve_reaches_the_caller() {
        let (tx, mut rx) = oneshot::channel();
        let op = PendingOperation::new(
            OperationId(7),
            PeripheralId::from("A"),
            OperationKind::DiscoverServices,
            Some(tx),
        );
        op.resolve(Ok(vec![1, 2]));
        assert_eq!(rx.try_recv().unwrap(), Ok(vec![1, 2]));
    }

    #[test]
    fn subscriptions_become_cccd_writes() {
        let kind = OperationKind::Subscribe {
            service: SERVICE,
            characteristic: MEASUREMENT,
            mode: SubscriptionMode::Indication,
        };
        assert_eq!(
            kind.request(),
            GattRequestKind::WriteDescriptor {
                service: SERVICE,
                characteristic: MEASUREMENT,
                descriptor: BleUuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
                value: vec![0x02, 0x00],
            }
        );
        assert_eq!(kind.payload_len(), None);

        let unsubscribe = OperationKind::Unsubscribe {
            service: SERVICE,
            characteristic: MEASUREMENT,
        };
        assert!(matches!(
            unsubscribe.request(),
            GattRequestKind::WriteDescriptor { value, .. } if value == vec![0x00, 0x00]
        ));
    }

    #[test]
    fn write_without_response_is_unacknowledged() {
        let kind = OperationKind::WriteCharacteristic {
            service: SERVICE,
            characteristic: MEASUREMENT,
            value: vec![0; 4],
            with_response: false,
        };
        assert!(kind.is_unacknowledged());
        assert_eq!(kind.payload_len(), Some(4));
        assert!(!OperationKind::DiscoverServices.is_unacknowledged());
        assert!(OperationKind::DiscoverServices.is_discovery());
    }
}
