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

use std::{fmt, str::FromStr};

use super::BluetoothError;

/// Power/authorization state of the host's Bluetooth adapter, as last
/// reported by the native stack.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Default)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Resetting,
    Unauthorized,
    #[default]
    Unknown,
    Unsupported,
}

impl AdapterState {
    /// Label used by bridge clients for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::PoweredOn => "Powered On",
            AdapterState::PoweredOff => "Powered Off",
            AdapterState::Resetting => "Resetting",
            AdapterState::Unauthorized => "Unauthorized",
            AdapterState::Unknown => "Unknown",
            AdapterState::Unsupported => "Unsupported",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterState {
    type Err = BluetoothError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Powered On" => Ok(AdapterState::PoweredOn),
            "Powered Off" => Ok(AdapterState::PoweredOff),
            "Resetting" => Ok(AdapterState::Resetting),
            "Unauthorized" => Ok(AdapterState::Unauthorized),
            "Unknown" => Ok(AdapterState::Unknown),
            "Unsupported" => Ok(AdapterState::Unsupported),
            other => Err(BluetoothError::InvalidArgument(format!(
                "unknown adapter state {:?}",
                other
            ))),
        }
    }
}

/// GAP role the session was started in. Only `Central` sessions accept
/// scanning, connection and GATT client operations.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Role {
    Central,
    Peripheral,
}

/// Connection lifecycle of a single peripheral.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// How a characteristic pushes value changes to us. Notifications are
/// unacknowledged; indications are confirmed by the client and are slower.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum SubscriptionMode {
    Notification,
    Indication,
}

impl SubscriptionMode {
    /// Client Characteristic Configuration value enabling this mode.
    /// Bluetooth Core Specification, Vol 3, Part G, Section 3.3.3.3.
    pub fn cccd_value(&self) -> [u8; 2] {
        match self {
            SubscriptionMode::Notification => [0x01, 0x00],
            SubscriptionMode::Indication => [0x02, 0x00],
        }
    }
}

/// Characteristic properties bit field.
/// Bluetooth Core Specification, Vol 3, Part G, Section 3.3.1.1.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn new(bits: u8) -> Self {
        CharacteristicProperties(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    /// Whether the characteristic can push values in `mode`. A platform that
    /// doesn't report properties yields an empty set, which allows anything.
    pub fn supports(&self, mode: SubscriptionMode) -> bool {
        if self.0 == 0 {
            return true;
        }
        match mode {
            SubscriptionMode::Notification => self.contains(Self::NOTIFY),
            SubscriptionMode::Indication => self.contains(Self::INDICATE),
        }
    }
}
