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

//! The gateway's channel set.
//!
//! Six unidirectional zmq channels plus the one-shot rendezvous socket, all
//! bound under a common base endpoint. This module is transport only: it
//! frames, encodes and decodes protocol messages but carries no dispatch or
//! engine logic.
//!
//! The heartbeat and metrics channels are lossy by design: sends are
//! non-blocking and silently dropped when no subscriber is connected or the
//! context is tearing down, so shutdown order between the gateway and its
//! client does not matter.

use anyhow::{bail, Context as _, Result};
use tracing as log;

use crate::protocols::{
    self, EngineResponse, HealthStatus, KvMetrics, NixlAgentMetadata, RemotePrefillRequest,
    SerializedError, StartupReply, StartupRequest, StartupResponse,
};

/// Suffixes appended to the base endpoint, one per channel.
pub const IPC_INPUT_EXT: &str = "_input_socket";
pub const IPC_OUTPUT_EXT: &str = "_output_socket";
pub const IPC_HEALTH_EXT: &str = "_health_socket";
pub const IPC_METRICS_EXT: &str = "_metrics_socket";
pub const IPC_DATA_EXT: &str = "_data_socket";
pub const IPC_REMOTE_PREFILL_REQUEST_EXT: &str = "_remote_prefill_request_socket";
pub const IPC_REMOTE_NIXL_METADATA_EXT: &str = "_remote_nixl_metadata_socket";

/// A raw INPUT message: one frame holding the request union, optionally
/// followed by a second frame of opaque sampling-hook bytes.
pub type InputFrames = Vec<Vec<u8>>;

/// All channels the gateway owns. Dropping the set closes every socket and
/// terminates the context, so teardown is exhaustive on any exit path.
pub struct ChannelSet {
    ctx: zmq::Context,

    /// Client requests in (PULL).
    input: zmq::Socket,
    /// Responses and errors out (PUSH).
    output: zmq::Socket,
    /// Health heartbeats out (PUSH).
    heartbeat: zmq::Socket,
    /// KV metrics out (PUSH); handed to the stat publisher at construction.
    metrics: Option<zmq::Socket>,

    /// Prefill hand-offs to the peer engine (PUSH); bound only when
    /// disaggregated transfer is enabled.
    remote_prefill: Option<zmq::Socket>,
    /// Peer memory-registration metadata in (PULL); same gating.
    remote_nixl_metadata: Option<zmq::Socket>,

    /// Endpoint of the one-shot rendezvous ROUTER, bound lazily in
    /// [`ChannelSet::serve_startup`].
    data_endpoint: String,
}

impl ChannelSet {
    /// Bind the full channel set under `ipc_path`.
    pub fn bind(ipc_path: &str, disaggregated: bool) -> Result<ChannelSet> {
        let ctx = zmq::Context::new();

        let input = bind_socket(&ctx, zmq::PULL, ipc_path, IPC_INPUT_EXT)?;
        let output = bind_socket(&ctx, zmq::PUSH, ipc_path, IPC_OUTPUT_EXT)?;
        let heartbeat = bind_socket(&ctx, zmq::PUSH, ipc_path, IPC_HEALTH_EXT)?;
        let metrics = bind_socket(&ctx, zmq::PUSH, ipc_path, IPC_METRICS_EXT)?;

        let (remote_prefill, remote_nixl_metadata) = if disaggregated {
            (
                Some(bind_socket(
                    &ctx,
                    zmq::PUSH,
                    ipc_path,
                    IPC_REMOTE_PREFILL_REQUEST_EXT,
                )?),
                Some(bind_socket(
                    &ctx,
                    zmq::PULL,
                    ipc_path,
                    IPC_REMOTE_NIXL_METADATA_EXT,
                )?),
            )
        } else {
            (None, None)
        };

        log::debug!("channel set bound at {ipc_path}");

        Ok(ChannelSet {
            ctx,
            input,
            output,
            heartbeat,
            metrics: Some(metrics),
            remote_prefill,
            remote_nixl_metadata,
            data_endpoint: format!("{ipc_path}{IPC_DATA_EXT}"),
        })
    }

    /// Transfer ownership of the metrics channel to its publisher. Can only
    /// be taken once.
    pub fn take_metrics_channel(&mut self) -> Result<MetricsChannel> {
        let socket = self
            .metrics
            .take()
            .context("metrics channel already taken")?;
        Ok(MetricsChannel { socket })
    }

    /// Block up to `timeout_ms` for the INPUT channel to become readable.
    /// Returns `false` on timeout without consuming anything.
    pub fn wait_for_input(&self, timeout_ms: u64) -> Result<bool> {
        let events = self
            .input
            .poll(zmq::POLLIN, timeout_ms as i64)
            .context("polling input channel")?;
        Ok(events > 0)
    }

    /// Zero-wait poll of the INPUT channel. Returns `None` when no complete
    /// message is queued.
    pub fn try_recv_input(&self) -> Result<Option<InputFrames>> {
        if self.input.poll(zmq::POLLIN, 0).context("polling input channel")? == 0 {
            return Ok(None);
        }
        let frames = self
            .input
            .recv_multipart(0)
            .context("receiving input frames")?;
        Ok(Some(frames))
    }

    /// Publish a response on the OUTPUT channel. Failures here are fatal to
    /// the control loop; the client owns the other end of this socket.
    pub fn send_response(&self, response: &EngineResponse) -> Result<()> {
        let bytes = protocols::encode(response).context("encoding response")?;
        self.output
            .send(bytes, 0)
            .context("sending on output channel")?;
        Ok(())
    }

    /// Send the healthy sentinel. Dropped silently when nobody is listening.
    pub fn send_healthy(&self) {
        self.send_heartbeat(&HealthStatus::Healthy);
    }

    /// Send a serialized error as the heartbeat. Dropped silently when nobody
    /// is listening.
    pub fn send_unhealthy(&self, error: &SerializedError) {
        self.send_heartbeat(&HealthStatus::Unhealthy(error.clone()));
    }

    fn send_heartbeat(&self, status: &HealthStatus) {
        let bytes = match protocols::encode(status) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode heartbeat: {e}");
                return;
            }
        };
        if let Err(e) = self.heartbeat.send(bytes, zmq::DONTWAIT) {
            log::trace!("heartbeat dropped: {e}");
        }
    }

    /// Forward a prefill hand-off to the peer engine.
    pub fn send_remote_prefill(&self, request: &RemotePrefillRequest) -> Result<()> {
        let Some(socket) = &self.remote_prefill else {
            bail!("remote prefill requested but disaggregated transfer is not enabled");
        };
        let bytes = protocols::encode(request).context("encoding remote prefill request")?;
        socket
            .send(bytes, 0)
            .context("sending on remote prefill channel")?;
        Ok(())
    }

    /// Zero-wait poll of the REMOTE_NIXL_METADATA channel. Returns `None`
    /// when the channel is not bound or has no queued frame.
    pub fn try_recv_peer_metadata(&self) -> Result<Option<NixlAgentMetadata>> {
        let Some(socket) = &self.remote_nixl_metadata else {
            return Ok(None);
        };
        if socket
            .poll(zmq::POLLIN, 0)
            .context("polling remote metadata channel")?
            == 0
        {
            return Ok(None);
        }
        let frame = socket
            .recv_bytes(0)
            .context("receiving remote metadata frame")?;
        let metadata =
            protocols::decode(&frame).context("decoding peer memory-registration metadata")?;
        Ok(Some(metadata))
    }

    /// Serve the one-shot rendezvous: wait for a single `IsServerReady`
    /// query, assemble the startup response via `assemble`, reply once and
    /// close the rendezvous socket.
    ///
    /// An error inside `assemble` becomes the reply payload rather than a
    /// loop failure; the client decides what to do with it.
    pub fn serve_startup<F>(&self, assemble: F) -> Result<()>
    where
        F: FnOnce() -> Result<StartupResponse>,
    {
        let socket = self
            .ctx
            .socket(zmq::ROUTER)
            .context("creating rendezvous socket")?;
        socket.set_linger(0)?;
        socket
            .bind(&self.data_endpoint)
            .with_context(|| format!("binding rendezvous socket at {}", self.data_endpoint))?;

        let frames = socket
            .recv_multipart(0)
            .context("receiving rendezvous query")?;
        if frames.len() != 2 {
            bail!(
                "broken rendezvous contract: expected 2 frames, got {}",
                frames.len()
            );
        }
        let identity = &frames[0];
        let StartupRequest::IsServerReady =
            protocols::decode(&frames[1]).context("decoding rendezvous query")?;

        let reply = match assemble() {
            Ok(response) => StartupReply::Ready(response),
            Err(e) => StartupReply::Error(SerializedError::from_error(&e)),
        };
        let bytes = protocols::encode(&reply).context("encoding rendezvous reply")?;
        socket
            .send_multipart([identity.as_slice(), bytes.as_slice()], 0)
            .context("sending rendezvous reply")?;

        // socket drops here; linger 0 means close is immediate
        Ok(())
    }

    /// Close every socket and terminate the context. Teardown order across
    /// channels is unspecified but exhaustive.
    pub fn shutdown(self) {
        drop(self);
        log::debug!("channel set closed");
    }
}

/// The METRICS channel, owned by the KV stat publisher after construction.
pub struct MetricsChannel {
    socket: zmq::Socket,
}

impl MetricsChannel {
    #[cfg(test)]
    pub(crate) fn from_socket(socket: zmq::Socket) -> MetricsChannel {
        MetricsChannel { socket }
    }

    /// Publish one snapshot. Sends are non-blocking and silently skipped when
    /// the channel has no subscriber or is shutting down.
    pub fn send(&self, metrics: &KvMetrics) {
        let bytes = match protocols::encode(metrics) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode kv metrics: {e}");
                return;
            }
        };
        if let Err(e) = self.socket.send(bytes, zmq::DONTWAIT) {
            log::trace!("kv metrics snapshot dropped: {e}");
        }
    }
}

fn bind_socket(
    ctx: &zmq::Context,
    kind: zmq::SocketType,
    ipc_path: &str,
    suffix: &str,
) -> Result<zmq::Socket> {
    let endpoint = format!("{ipc_path}{suffix}");
    let socket = ctx.socket(kind)?;
    socket.set_linger(0)?;
    socket
        .bind(&endpoint)
        .with_context(|| format!("binding {endpoint}"))?;
    Ok(socket)
}
