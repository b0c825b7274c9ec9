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

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use super::BluetoothError;

/// Maximum attribute value length of a write on an unextended link
/// (ATT_MTU of 23 minus the 3 byte ATT header).
pub const DEFAULT_MAX_WRITE_LEN: usize = 20;

/// What happens to application events while the session is paused.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PausePolicy {
    /// Keep every event in a bounded buffer and deliver it on resume. When
    /// the buffer is full the oldest event is dropped.
    Queue,
    /// Discard discovery and notification events; deliver everything else.
    Drop,
}

/// Tunables of a session. Every field has a default, so a JSON document only
/// needs to name what it overrides.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionConfig {
    /// How long a dispatched GATT operation may stay in flight.
    pub operation_timeout_ms: u64,
    /// How long a peripheral may stay in `Connecting`.
    pub connect_timeout_ms: u64,
    /// Write payload cap used until the native stack reports an MTU.
    pub default_max_write_len: usize,
    pub pause_buffer_capacity: usize,
    pub pause_policy: PausePolicy,
    /// Automatic retries of a discovery step after a transient error.
    pub discovery_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            operation_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            default_max_write_len: DEFAULT_MAX_WRITE_LEN,
            pause_buffer_capacity: 64,
            pause_policy: PausePolicy::Queue,
            discovery_retries: 1,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, BluetoothError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BluetoothError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            BluetoothError::InvalidArgument(format!(
                "can't read config {}: {}",
                path.display(),
                err
            ))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), BluetoothError> {
        if self.operation_timeout_ms == 0 {
            return Err(BluetoothError::InvalidArgument(String::from(
                "operationTimeoutMs must be positive",
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(BluetoothError::InvalidArgument(String::from(
                "connectTimeoutMs must be positive",
            )));
        }
        if self.default_max_write_len == 0 {
            return Err(BluetoothError::InvalidArgument(String::from(
                "defaultMaxWriteLen must be positive",
            )));
        }
        if self.pause_policy == PausePolicy::Queue && self.pause_buffer_capacity == 0 {
            return Err(BluetoothError::InvalidArgument(String::from(
                "pauseBufferCapacity must be positive when pausePolicy is queue",
            )));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
