// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Remote prefill coordination for disaggregated serving.
//!
//! Two independent flows meet here:
//!
//! - Outbound: when a request is admitted with `is_remote_prefill`, the
//!   gateway binds it to this coordinator before handing it to the engine.
//!   The engine fires the binding whenever it decides the prompt must be
//!   served by the peer; fired hand-offs are forwarded onto the
//!   REMOTE_PREFILL_REQUEST channel at the end of the same control-loop tick.
//! - Inbound: before every input pass the gateway drains peer
//!   memory-registration metadata from REMOTE_NIXL_METADATA and registers it
//!   with the engine, keyed by engine id. The drain never blocks and accepts
//!   an unbounded stream of updates over the process lifetime.

use std::sync::mpsc;

use anyhow::Result;
use tracing as log;

use crate::engine::EngineAdapter;
use crate::ipc::ChannelSet;
use crate::protocols::{RemotePrefillParams, RemotePrefillRequest};

/// Per-request hand-off callback, installed by the gateway and fired by the
/// engine at any point during admission or execution.
pub struct RemotePrefillBinding {
    pub params: RemotePrefillParams,
    tx: mpsc::Sender<RemotePrefillRequest>,
}

impl RemotePrefillBinding {
    /// Queue a prompt hand-off for the peer engine. Fire-and-forget; the
    /// coordinator forwards it on the wire at the end of the current tick.
    pub fn request_remote_prefill(&self, request: RemotePrefillRequest) {
        log::debug!("queueing remote prefill request: {}", request.request_id);
        if self.tx.send(request).is_err() {
            // Only possible during teardown, once the coordinator is gone.
            log::warn!("remote prefill queue closed; dropping hand-off");
        }
    }
}

pub struct RemotePrefillCoordinator {
    tx: mpsc::Sender<RemotePrefillRequest>,
    rx: mpsc::Receiver<RemotePrefillRequest>,
}

impl RemotePrefillCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        RemotePrefillCoordinator { tx, rx }
    }

    /// Bind a request's remote-prefill parameters to this coordinator.
    pub fn bind_request(&self, params: RemotePrefillParams) -> RemotePrefillBinding {
        RemotePrefillBinding {
            params,
            tx: self.tx.clone(),
        }
    }

    /// Forward every hand-off queued since the last pump onto the
    /// REMOTE_PREFILL_REQUEST channel.
    pub fn pump(&self, channels: &ChannelSet) -> Result<()> {
        while let Ok(request) = self.rx.try_recv() {
            log::debug!("sending remote prefill request: {}", request.request_id);
            channels.send_remote_prefill(&request)?;
        }
        Ok(())
    }

    /// Drain inbound peer metadata and register each frame with the engine.
    /// Never blocks waiting for a frame.
    pub fn drain_peer_metadata(
        &self,
        channels: &ChannelSet,
        adapter: &mut dyn EngineAdapter,
    ) -> Result<()> {
        while let Some(metadata) = channels.try_recv_peer_metadata()? {
            log::debug!(
                "registering remote transfer metadata for engine: {}",
                metadata.engine_id
            );
            adapter.register_peer_metadata(metadata)?;
        }
        Ok(())
    }
}

impl Default for RemotePrefillCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
