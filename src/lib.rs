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

//! Central-role BLE session manager. A `Session` serializes GATT traffic per
//! peripheral, caches discovered attribute trees, tracks subscriptions and
//! turns native stack callbacks into an ordered `EventStream`. Native stacks
//! plug in through `api::BleBackend`; `sim` provides a virtual one.

pub mod api;
mod common;
pub mod session;
pub mod sim;

pub use common::{
    AdapterState, Advertisement, BleUuid, BluetoothError,
    CharacteristicProperties, ConnectionState, PausePolicy, PeripheralId,
    Role, SessionConfig, SubscriptionMode, DEFAULT_MAX_WRITE_LEN,
};
pub use session::{EventStream, PeripheralSnapshot, Session, SessionEvent};
