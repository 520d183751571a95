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

//! Contract between the gateway and the engine it drives.
//!
//! The engine is opaque to the gateway: scheduling, batching, KV placement
//! and model execution all live behind [`EngineAdapter`]. The gateway only
//! ever mutates the adapter sequentially from its single control thread, so
//! none of these methods need interior synchronization.

use anyhow::Result;

use crate::prefill::RemotePrefillBinding;
use crate::protocols::{
    Device, LoraDescriptor, NixlAgentMetadata, ProcessRequest, RequestOutput, SleepLevel,
};

/// Fixed capacities of the engine, queried once at gateway construction to
/// seed the KV stat publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapacity {
    /// Maximum number of concurrently scheduled requests.
    pub request_slots: u64,
    /// Total number of KV cache blocks on the accelerator.
    pub kv_blocks: u64,
}

/// A snapshot of scheduler-level statistics, produced by the engine whenever
/// it computes fresh numbers (typically once per step and on idle flushes).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SchedulerStats {
    pub num_running: u64,
    pub num_waiting: u64,
    /// Fraction of GPU KV cache blocks in use, in [0, 1].
    pub gpu_cache_usage: f32,
    /// GPU prefix cache hit rate, in [0, 1].
    pub gpu_prefix_cache_hit_rate: f32,
}

/// Receives [`SchedulerStats`] snapshots from the engine. Attached via
/// [`EngineAdapter::attach_stat_sink`] and invoked on the control thread.
pub trait StatSink: Send {
    fn record(&self, stats: &SchedulerStats);
}

/// Publication hook the gateway lends to the adapter for the duration of one
/// [`EngineAdapter::step`] call when IO overlap is enabled. The adapter must
/// invoke it exactly once, at the point in the step where outputs for the
/// previous batch are final; ownership reverts to the gateway when the step
/// returns.
pub type OutputHook<'a> = &'a mut dyn FnMut(Vec<RequestOutput>);

/// How a step failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Batch preparation failed for one specific request. The request is
    /// dropped from the current step; the engine remains usable.
    #[error("input processing failed for request {request_id}")]
    Request {
        request_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Anything else. Latches the gateway's fatal state and unwinds the
    /// control loop.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

/// Raised in place of admission once the fatal latch is set: the engine loop
/// is no longer running and the request can never complete.
#[derive(Debug)]
pub struct EngineDeadError {
    pub cause: Option<String>,
}

impl std::error::Error for EngineDeadError {}

impl std::fmt::Display for EngineDeadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(
                f,
                "Engine loop is not running. Inspect the stacktrace to find the original error: {cause}"
            ),
            None => write!(
                f,
                "Engine loop is not running. Inspect the stacktrace to find the original error"
            ),
        }
    }
}

/// Marker wrapper for a failure that happened on a remote executor of a
/// distributed engine backend. When the gateway is configured for it, error
/// publication unwraps this to the underlying cause (see
/// [`crate::GatewayConfig::unwrap_distributed_errors`]).
#[derive(Debug)]
pub struct RemoteTaskError {
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl std::fmt::Display for RemoteTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task failed on a remote executor: {}", self.cause)
    }
}

impl std::error::Error for RemoteTaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// The stepwise generation engine, as the gateway sees it.
///
/// Mutating methods return `Err` to report failure; the gateway classifies
/// those failures per its error taxonomy (per-request for `admit` and
/// `load_adapter`, fatal for everything escaping a dispatch pass or a step).
pub trait EngineAdapter: Send {
    /// Whether any admitted request still needs compute.
    fn has_pending_work(&self) -> bool;

    /// Run one execution step. With `hook` present, the adapter invokes it
    /// with the finalized outputs during the step and returns an empty list;
    /// otherwise outputs are returned directly.
    fn step(&mut self, hook: Option<OutputHook<'_>>) -> Result<Vec<RequestOutput>, StepError>;

    /// Admit a new request. `prefill` is present when the request asked for
    /// remote prefill; the engine may fire it at any point during admission
    /// or execution to hand the prompt off to a peer.
    fn admit(
        &mut self,
        request: ProcessRequest,
        prefill: Option<RemotePrefillBinding>,
    ) -> Result<()>;

    /// Remove a request from the engine. Unknown ids are a silent no-op.
    fn abort(&mut self, request_id: &str);

    /// Probe engine health. An `Err` latches the gateway's fatal state.
    fn check_health(&mut self) -> Result<()>;

    fn is_tracing_enabled(&self) -> bool;

    /// Whether this engine participates in disaggregated (prefill/decode)
    /// serving. Gates the two remote-prefill channels and the NIXL blob in
    /// the startup response.
    fn is_disaggregated_transfer_enabled(&self) -> bool;

    /// This engine's own memory-registration metadata, already encoded for
    /// the wire. Only called when disaggregated transfer is enabled.
    fn own_transfer_metadata(&self) -> Result<Vec<u8>>;

    /// Register a peer engine's memory-registration metadata, keyed by its
    /// engine id. Registration is additive and never revoked.
    fn register_peer_metadata(&mut self, metadata: NixlAgentMetadata) -> Result<()>;

    fn start_profile(&mut self) -> Result<()>;

    fn stop_profile(&mut self) -> Result<()>;

    /// Returns whether any cache entries were dropped.
    fn reset_prefix_cache(&mut self, device: Device) -> bool;

    fn reset_multimodal_cache(&mut self) -> Result<()>;

    fn sleep(&mut self, level: SleepLevel) -> Result<()>;

    fn wake_up(&mut self, tags: Option<Vec<String>>) -> Result<()>;

    fn is_sleeping(&self) -> bool;

    /// Load a LoRA adapter into the engine.
    fn load_adapter(&mut self, descriptor: LoraDescriptor) -> Result<()>;

    /// Fixed capacities, stable for the engine's lifetime.
    fn capacity(&self) -> EngineCapacity;

    /// Attach a named stat sink. The engine drives attached sinks whenever it
    /// computes fresh statistics and on every `log_stats` call.
    fn attach_stat_sink(&mut self, name: &str, sink: Box<dyn StatSink>);

    /// Flush current statistics to the attached sinks.
    fn log_stats(&mut self);
}
