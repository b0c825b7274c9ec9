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

use thiserror::Error;

/// Library error type.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Clone)]
pub enum BluetoothError {
    /// Reported when the adapter is not started, has been cleaned up, or the
    /// session engine is gone.
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,
    /// Indicates that the operation was rejected because the peripheral or the
    /// session is not in a state required for the operation's execution.
    /// E.g. the user calls `connect()` on a peripheral that is already
    /// connecting.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Reported when an identifier (peripheral, service, characteristic or
    /// descriptor) is unknown to the session.
    #[error("not found: {0}")]
    NotFound(String),
    /// Reported when an operation was aborted by link loss.
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// Reported when the native stack did not answer in time.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Reported when a write payload exceeds the link's negotiated maximum
    /// transmission size. No native call is made in that case.
    #[error("payload of {len} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge { len: usize, max: usize },
    /// Reported when the user calls an operation the platform or the device
    /// can't perform. E.g. enumerating known peripherals without scanning.
    #[error("bluetooth operation not supported: {0}")]
    NotSupported(String),
    /// Reported when a UUID, identifier or configuration value is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Wrapper around errors reported by the native stack. These are treated
    /// as transient and are retried once during discovery.
    #[error("bluetooth system-level error: {0}")]
    System(String),
    /// Reported when `cleanup()` is called on a session a second time.
    #[error("session already cleaned up")]
    AlreadyCleanedUp,
    /// Reported when a bug occurs inside the library. Whenever a seemingly
    /// impossible error condition arises where you could call `expect()`,
    /// return this error instead.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BluetoothError {
    /// Whether a failed native request is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, BluetoothError::System(_))
    }
}

impl From<serde_json::Error> for BluetoothError {
    fn from(err: serde_json::Error) -> Self {
        BluetoothError::InvalidArgument(err.to_string())
    }
}
