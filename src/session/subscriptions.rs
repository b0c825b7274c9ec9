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

use crate::common::{BleUuid, PeripheralId, SubscriptionMode};

/// A confirmed notification/indication subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionEntry {
    pub service: BleUuid,
    pub characteristic: BleUuid,
    pub mode: SubscriptionMode,
    /// Cleared while an unsubscribe for the characteristic is in progress.
    pub active: bool,
}

type Key = (PeripheralId, BleUuid, BleUuid);

#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    entries: HashMap<Key, SubscriptionEntry>,
}

impl SubscriptionTable {
    /// Insert an active entry, replacing any previous one for the same
    /// characteristic.
    pub(crate) fn insert(
        &mut self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        mode: SubscriptionMode,
    ) -> Option<SubscriptionEntry> {
        self.entries.insert(
            (peripheral.clone(), service, characteristic),
            SubscriptionEntry {
                service,
                characteristic,
                mode,
                active: true,
            },
        )
    }

    pub(crate) fn remove(
        &mut self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<SubscriptionEntry> {
        self.entries
            .remove(&(peripheral.clone(), service, characteristic))
    }

    /// Toggle delivery for an existing entry. Returns `false` if there is
    /// none.
    pub(crate) fn set_active(
        &mut self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
        active: bool,
    ) -> bool {
        match self
            .entries
            .get_mut(&(peripheral.clone(), service, characteristic))
        {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(
        &self,
        peripheral: &PeripheralId,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> bool {
        self.entries
            .get(&(peripheral.clone(), service, characteristic))
            .map_or(false, |entry| entry.active)
    }

    /// Drop every entry of `peripheral`, returning how many there were.
    pub(crate) fn remove_peripheral(&mut self, peripheral: &PeripheralId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(id, _, _), _| id != peripheral);
        before - self.entries.len()
    }

    /// Entries of `peripheral`, ordered by service then characteristic.
    pub(crate) fn entries_for(&self, peripheral: &PeripheralId) -> Vec<SubscriptionEntry> {
        let mut entries: Vec<SubscriptionEntry> = self
            .entries
            .iter()
            .filter(|((id, _, _), _)| id == peripheral)
            .map(|(_, entry)| entry.clone())
            .collect();
        entries.sort_by_key(|entry| (entry.service, entry.characteristic));
        entries
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
