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

use super::{BleUuid, PeripheralId};

/// Holds data related to an incoming BLE Advertisement: who sent it, the
/// advertised local name and the service UUIDs listed in it. Backends should
/// fill in whatever their platform exposes.
#[derive(Clone, Debug, PartialEq)]
pub struct Advertisement {
    id: PeripheralId,
    name: Option<String>,
    rssi: Option<i16>,
    services: Vec<BleUuid>,
}

impl Advertisement {
    /// Construct a new `Advertisement` instance.
    pub fn new(id: PeripheralId) -> Self {
        Advertisement {
            id,
            name: None,
            rssi: None,
            services: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_services(mut self, services: Vec<BleUuid>) -> Self {
        self.services = services;
        self
    }

    /// Retrieve the identifier of the peripheral that emitted this
    /// advertisement.
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    pub fn services(&self) -> &[BleUuid] {
        &self.services
    }

    /// A missing filter matches everything; otherwise at least one advertised
    /// service has to be in the filter.
    pub fn matches(&self, filter: Option<&[BleUuid]>) -> bool {
        match filter {
            None => true,
            Some(filter) => self.services.iter().any(|uuid| filter.contains(uuid)),
        }
    }
}
