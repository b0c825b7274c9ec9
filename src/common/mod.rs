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

mod advertisement;
mod config;
mod error;
mod identifier;
mod state;

pub use advertisement::Advertisement;
pub use config::{PausePolicy, SessionConfig, DEFAULT_MAX_WRITE_LEN};
pub use error::BluetoothError;
pub use identifier::{BleUuid, PeripheralId};
pub use state::{
    AdapterState, CharacteristicProperties, ConnectionState, Role,
    SubscriptionMode,
};
