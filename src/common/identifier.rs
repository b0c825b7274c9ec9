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

/// Low 96 bits of the Bluetooth Base UUID,
/// `00000000-0000-1000-8000-00805F9B34FB`.
/// Bluetooth Core Specification, Vol 3, Part B, Section 2.5.1.
const BASE_UUID: u128 = 0x0000_1000_8000_0080_5F9B_34FB;
const BASE_MASK: u128 = (1u128 << 96) - 1;

/// Opaque, stable identifier of a peripheral as reported by the native stack.
/// Usually a MAC address, but some platforms hand out random UUIDs instead.
#[derive(PartialEq, Eq, Clone, Debug, Hash, PartialOrd, Ord)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty identifiers never name a peripheral; the session rejects them.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId(String::from(id))
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 128-bit Bluetooth UUID. Services, characteristics and descriptors are
/// all identified this way; 16 and 32-bit SIG-assigned values are aliases
/// into the Bluetooth Base UUID range, so `"180D"` and
/// `"0000180d-0000-1000-8000-00805f9b34fb"` are the same `BleUuid`.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub struct BleUuid(u128);

impl BleUuid {
    /// Client Characteristic Configuration descriptor.
    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: BleUuid =
        BleUuid::from_u16(0x2902);

    pub const fn from_u128(val: u128) -> Self {
        BleUuid(val)
    }

    /// Expand a 16-bit assigned number against the Base UUID.
    pub const fn from_u16(short: u16) -> Self {
        BleUuid(((short as u128) << 96) | BASE_UUID)
    }

    /// Expand a 32-bit assigned number against the Base UUID.
    pub const fn from_u32(short: u32) -> Self {
        BleUuid(((short as u128) << 96) | BASE_UUID)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// The 16 or 32-bit alias, if this UUID lies in the Base UUID range.
    pub fn short_form(&self) -> Option<u32> {
        if self.0 & BASE_MASK == BASE_UUID {
            Some((self.0 >> 96) as u32)
        } else {
            None
        }
    }
}

impl FromStr for BleUuid {
    type Err = BluetoothError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || {
            BluetoothError::InvalidArgument(format!("malformed UUID {:?}", s))
        };

        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        match (hex.len(), s.len() - hex.len()) {
            (4, 0) => u16::from_str_radix(&hex, 16)
                .map(BleUuid::from_u16)
                .map_err(|_| invalid()),
            (8, 0) => u32::from_str_radix(&hex, 16)
                .map(BleUuid::from_u32)
                .map_err(|_| invalid()),
            (32, 0) => u128::from_str_radix(&hex, 16)
                .map(BleUuid)
                .map_err(|_| invalid()),
            (32, 4) => {
                let bytes = s.as_bytes();
                if [8, 13, 18, 23].iter().any(|&i| bytes[i] != b'-') {
                    return Err(invalid());
                }
                u128::from_str_radix(&hex, 16)
                    .map(BleUuid)
                    .map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.short_form() {
            Some(short) if short <= u16::MAX as u32 => write!(f, "{:04X}", short),
            Some(short) => write!(f, "{:08X}", short),
            None => {
                let v = self.0;
                write!(
                    f,
                    "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
                    (v >> 96) as u32,
                    (v >> 80) as u16,
                    (v >> 64) as u16,
                    (v >> 48) as u16,
                    v & 0xFFFF_FFFF_FFFF,
                )
            }
        }
    }
}

impl From<u16> for BleUuid {
    fn from(short: u16) -> Self {
        BleUuid::from_u16(short)
    }
}
