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

use crate::common::{BleUuid, CharacteristicProperties};

#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorNode {
    uuid: BleUuid,
}

impl DescriptorNode {
    pub fn uuid(&self) -> BleUuid {
        self.uuid
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CharacteristicNode {
    uuid: BleUuid,
    properties: CharacteristicProperties,
    descriptors: Vec<DescriptorNode>,
}

impl CharacteristicNode {
    pub fn uuid(&self) -> BleUuid {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Descriptors in discovery order.
    pub fn descriptors(&self) -> &[DescriptorNode] {
        &self.descriptors
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceNode {
    uuid: BleUuid,
    characteristics: Vec<CharacteristicNode>,
}

impl ServiceNode {
    pub fn uuid(&self) -> BleUuid {
        self.uuid
    }

    /// Characteristics in discovery order.
    pub fn characteristics(&self) -> &[CharacteristicNode] {
        &self.characteristics
    }
}

/// Per-peripheral attribute tree, filled in while discovery results stream
/// in. Any level may be partially populated at a given time.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct GattCache {
    services: Vec<ServiceNode>,
}

impl GattCache {
    pub(crate) fn clear(&mut self) {
        self.services.clear();
    }

    pub(crate) fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    /// Returns `false` for a service that is already cached.
    pub(crate) fn add_service(&mut self, uuid: BleUuid) -> bool {
        if self.service(uuid).is_some() {
            return false;
        }
        self.services.push(ServiceNode {
            uuid,
            characteristics: Vec::new(),
        });
        true
    }

    /// Returns `None` when the parent service isn't cached and `Some(false)`
    /// for a duplicate.
    pub(crate) fn add_characteristic(
        &mut self,
        service: BleUuid,
        uuid: BleUuid,
        properties: CharacteristicProperties,
    ) -> Option<bool> {
        let service = self.services.iter_mut().find(|s| s.uuid == service)?;
        if service.characteristics.iter().any(|c| c.uuid == uuid) {
            return Some(false);
        }
        service.characteristics.push(CharacteristicNode {
            uuid,
            properties,
            descriptors: Vec::new(),
        });
        Some(true)
    }

    /// Same contract as `add_characteristic()`.
    pub(crate) fn add_descriptor(
        &mut self,
        service: BleUuid,
        characteristic: BleUuid,
        uuid: BleUuid,
    ) -> Option<bool> {
        let characteristic = self
            .services
            .iter_mut()
            .find(|s| s.uuid == service)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == characteristic)?;
        if characteristic.descriptors.iter().any(|d| d.uuid == uuid) {
            return Some(false);
        }
        characteristic.descriptors.push(DescriptorNode { uuid });
        Some(true)
    }

    pub(crate) fn service(&self, uuid: BleUuid) -> Option<&ServiceNode> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub(crate) fn characteristic(
        &self,
        service: BleUuid,
        characteristic: BleUuid,
    ) -> Option<&CharacteristicNode> {
        self.service(service)?
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
    }

    pub(crate) fn descriptor(
        &self,
        service: BleUuid,
        characteristic: BleUuid,
        descriptor: BleUuid,
    ) -> Option<&DescriptorNode> {
        self.characteristic(service, characteristic)?
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
    }

    pub(crate) fn service_uuids(&self) -> Vec<BleUuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    pub(crate) fn characteristic_uuids(&self, service: BleUuid) -> Vec<BleUuid> {
        self.service(service)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .unwrap_or_default()
    }
}
