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

use tokio::time::Instant;

use super::{gatt::GattCache, Reply, ServiceNode, SubscriptionEntry};
use crate::{
    api::KnownPeripheral,
    common::{Advertisement, BleUuid, ConnectionState, PeripheralId},
};

/// Everything the session tracks about one peripheral.
#[derive(Debug)]
pub(crate) struct PeripheralRecord {
    pub(crate) id: PeripheralId,
    pub(crate) name: Option<String>,
    pub(crate) rssi: Option<i16>,
    /// Service UUIDs from the latest advertisement.
    pub(crate) advertised_services: Vec<BleUuid>,
    pub(crate) state: ConnectionState,
    /// Largest write payload the link accepts.
    pub(crate) max_write_len: usize,
    pub(crate) gatt: GattCache,
    /// Discovery steps queued or in flight.
    pub(crate) discovery_steps: usize,
    /// Bounds the time spent in `Connecting` and `Disconnecting`.
    pub(crate) state_deadline: Option<Instant>,
    pub(crate) connect_waiter: Option<Reply<()>>,
    pub(crate) disconnect_waiters: Vec<Reply<()>>,
}

impl PeripheralRecord {
    fn new(id: PeripheralId, max_write_len: usize) -> Self {
        PeripheralRecord {
            id,
            name: None,
            rssi: None,
            advertised_services: Vec::new(),
            state: ConnectionState::Disconnected,
            max_write_len,
            gatt: GattCache::default(),
            discovery_steps: 0,
            state_deadline: None,
            connect_waiter: None,
            disconnect_waiters: Vec::new(),
        }
    }
}

/// Point-in-time copy of a peripheral's record, GATT tree and
/// subscriptions, as returned by `Session::peripheral()`.
#[derive(Clone, Debug, PartialEq)]
pub struct PeripheralSnapshot {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertised_services: Vec<BleUuid>,
    pub state: ConnectionState,
    pub max_write_len: usize,
    pub services: Vec<ServiceNode>,
    pub subscriptions: Vec<SubscriptionEntry>,
}

/// Dedupes advertisements within one scan.
#[derive(Debug)]
struct ScanSession {
    filter: Option<Vec<BleUuid>>,
    /// Name last reported to the application for each peripheral.
    reported: HashMap<PeripheralId, Option<String>>,
}

/// What an advertisement should be reported as, if at all.
#[derive(Debug, PartialEq)]
pub(crate) struct Sighting {
    pub(crate) peripheral: PeripheralId,
    pub(crate) name: Option<String>,
    pub(crate) rssi: Option<i16>,
}

#[derive(Debug)]
pub(crate) struct DeviceRegistry {
    records: HashMap<PeripheralId, PeripheralRecord>,
    scan: Option<ScanSession>,
    default_max_write_len: usize,
}

impl DeviceRegistry {
    pub(crate) fn new(default_max_write_len: usize) -> Self {
        DeviceRegistry {
            records: HashMap::new(),
            scan: None,
            default_max_write_len,
        }
    }

    pub(crate) fn default_max_write_len(&self) -> usize {
        self.default_max_write_len
    }

    pub(crate) fn get(&self, id: &PeripheralId) -> Option<&PeripheralRecord> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &PeripheralId) -> Option<&mut PeripheralRecord> {
        self.records.get_mut(id)
    }

    pub(crate) fn get_or_insert(&mut self, id: &PeripheralId) -> &mut PeripheralRecord {
        let max_write_len = self.default_max_write_len;
        self.records
            .entry(id.clone())
            .or_insert_with(|| PeripheralRecord::new(id.clone(), max_write_len))
    }

    pub(crate) fn remove(&mut self, id: &PeripheralId) -> Option<PeripheralRecord> {
        if let Some(scan) = &mut self.scan {
            scan.reported.remove(id);
        }
        self.records.remove(id)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &PeripheralRecord> {
        self.records.values()
    }

    /// Identifiers of peripherals in any state but `Disconnected`.
    pub(crate) fn linked(&self) -> Vec<PeripheralId> {
        let mut ids: Vec<PeripheralId> = self
            .records
            .values()
            .filter(|r| r.state != ConnectionState::Disconnected)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.scan = None;
    }

    /// Start a fresh scan session; earlier sightings are forgotten.
    pub(crate) fn begin_scan(&mut self, filter: Option<Vec<BleUuid>>) {
        self.scan = Some(ScanSession {
            filter,
            reported: HashMap::new(),
        });
    }

    /// Returns whether a scan was active.
    pub(crate) fn end_scan(&mut self) -> bool {
        self.scan.take().is_some()
    }

    /// Fold an advertisement into the registry and decide whether the
    /// application hears about it: once per peripheral and scan, plus again
    /// whenever the advertised name changes.
    pub(crate) fn observe(&mut self, adv: &Advertisement) -> Option<Sighting> {
        let scan = self.scan.as_mut()?;

        if !adv.matches(scan.filter.as_deref()) {
            if let (Some(record), Some(rssi)) = (self.records.get_mut(adv.id()), adv.rssi()) {
                record.rssi = Some(rssi);
            }
            return None;
        }

        let max_write_len = self.default_max_write_len;
        let record = self
            .records
            .entry(adv.id().clone())
            .or_insert_with(|| PeripheralRecord::new(adv.id().clone(), max_write_len));
        if let Some(name) = adv.name() {
            record.name = Some(String::from(name));
        }
        if adv.rssi().is_some() {
            record.rssi = adv.rssi();
        }
        if !adv.services().is_empty() {
            record.advertised_services = adv.services().to_vec();
        }

        let report = match scan.reported.get(adv.id()) {
            None => true,
            Some(reported) => adv.name().is_some() && reported.as_deref() != adv.name(),
        };
        if !report {
            return None;
        }

        scan.reported.insert(adv.id().clone(), record.name.clone());
        Some(Sighting {
            peripheral: record.id.clone(),
            name: record.name.clone(),
            rssi: record.rssi,
        })
    }

    /// Make sure a peripheral returned by a native query has a record.
    pub(crate) fn register_known(&mut self, known: &KnownPeripheral) {
        let record = self.get_or_insert(&known.id);
        if known.name.is_some() {
            record.name = known.name.clone();
        }
    }
}
