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

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SessionEvent;
use crate::common::PausePolicy;

/// Last hop between the engine and the application. Owns the pause state
/// and the bounded buffer used while paused.
pub(crate) struct EventDispatcher {
    sender: mpsc::UnboundedSender<SessionEvent>,
    policy: PausePolicy,
    capacity: usize,
    paused: bool,
    buffer: VecDeque<SessionEvent>,
    /// Events lost to buffer overflow or the drop policy since the last
    /// resume.
    dropped: usize,
    receiver_gone: bool,
}

impl EventDispatcher {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<SessionEvent>,
        policy: PausePolicy,
        capacity: usize,
    ) -> Self {
        EventDispatcher {
            sender,
            policy,
            capacity,
            paused: false,
            buffer: VecDeque::new(),
            dropped: 0,
            receiver_gone: false,
        }
    }

    /// Discovery and notification events are held back while paused. Every
    /// other event goes straight through.
    pub(crate) fn emit(&mut self, event: SessionEvent) {
        if !self.paused || !event.is_suspendable() {
            self.deliver(event);
            return;
        }

        match self.policy {
            PausePolicy::Drop => {
                debug!("Paused, dropping {:?}", event);
                self.dropped += 1;
            }
            PausePolicy::Queue => {
                if self.capacity == 0 {
                    self.dropped += 1;
                    return;
                }
                while self.buffer.len() >= self.capacity {
                    if let Some(oldest) = self.buffer.pop_front() {
                        warn!("Pause buffer full, dropping oldest event {:?}", oldest);
                    }
                    self.dropped += 1;
                }
                self.buffer.push_back(event);
            }
        }
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        if paused == self.paused {
            return;
        }
        self.paused = paused;

        if paused {
            info!("Event delivery paused.");
        } else {
            info!(
                "Event delivery resumed, flushing {} buffered events ({} dropped).",
                self.buffer.len(),
                self.dropped
            );
            self.dropped = 0;
            while let Some(event) = self.buffer.pop_front() {
                self.deliver(event);
            }
        }
    }

    fn deliver(&mut self, event: SessionEvent) {
        if self.sender.send(event).is_err() && !self.receiver_gone {
            self.receiver_gone = true;
            warn!("Event stream was dropped, events are no longer delivered.");
        }
    }
}
