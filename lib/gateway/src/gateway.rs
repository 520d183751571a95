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

//! The request gateway control loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;
use tracing as log;

use crate::config::GatewayConfig;
use crate::engine::{EngineAdapter, EngineDeadError, RemoteTaskError, StepError};
use crate::ipc::{ChannelSet, InputFrames};
use crate::kv_stats::KvStatPublisher;
use crate::prefill::RemotePrefillCoordinator;
use crate::protocols::{
    self, EngineRequest, EngineResponse, ErrorResponse, LoadAdapterRequest, ProcessRequest,
    RequestOutput, SerializedError, StartupResponse,
};

/// Name under which the KV stat publisher is attached to the engine.
const KV_METRICS_SINK: &str = "kv_metrics";

/// The multiplexing front end for one engine process.
///
/// The gateway owns the channel set and the engine adapter. After the one-shot
/// startup rendezvous it runs a strictly sequential control loop: drain INPUT,
/// dispatch each message to the corresponding engine mutation, run exactly one
/// engine step, publish outputs. When the engine has no pending work, the loop
/// blocks on INPUT with a fixed timeout; every timeout emits a health
/// heartbeat and flushes engine statistics without consuming input.
///
/// With `overlap_io` enabled, output publication and the next input drain run
/// inside the step call, via a hook the gateway lends to the engine; no second
/// step can begin before the hook for the first has completed, so per-request
/// output ordering is preserved.
pub struct Gateway {
    config: GatewayConfig,
    channels: ChannelSet,
    adapter: Box<dyn EngineAdapter>,
    prefill: RemotePrefillCoordinator,
    cancel: CancellationToken,

    /// The fatal latch: set once with the first unrecoverable cause, never
    /// reset. Health probes and dead-engine replies serialize from it.
    errored_with: Option<Arc<anyhow::Error>>,

    /// INPUT frames drained by the overlap hook during a step, dispatched
    /// before the next step begins.
    staged: VecDeque<InputFrames>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        mut adapter: Box<dyn EngineAdapter>,
        cancel: CancellationToken,
    ) -> Result<Gateway> {
        let disaggregated = adapter.is_disaggregated_transfer_enabled();
        let mut channels = ChannelSet::bind(&config.ipc_path, disaggregated)?;

        // The publisher takes the metrics channel and emits its zeroed
        // snapshot before the loop starts.
        let capacity = adapter.capacity();
        let publisher = KvStatPublisher::new(
            capacity.request_slots,
            capacity.kv_blocks,
            channels.take_metrics_channel()?,
        );
        adapter.attach_stat_sink(KV_METRICS_SINK, Box::new(publisher));

        Ok(Gateway {
            config,
            channels,
            adapter,
            prefill: RemotePrefillCoordinator::new(),
            cancel,
            errored_with: None,
            staged: VecDeque::new(),
        })
    }

    /// Serve startup and the engine loop until fatal error or interrupt, then
    /// tear everything down. Cleanup runs on every exit path.
    pub fn run(mut self) -> Result<()> {
        let result = self.serve();
        match &result {
            Ok(()) => log::debug!("gateway loop exited cleanly"),
            Err(e) => log::error!("gateway loop terminated: {e:#}"),
        }
        self.cleanup();
        result
    }

    fn serve(&mut self) -> Result<()> {
        log::debug!("starting startup loop");
        self.run_startup_loop()?;
        log::debug!("starting engine loop");
        self.run_engine_loop()
    }

    /// Release the engine handle and every channel.
    fn cleanup(self) {
        let Gateway {
            channels, adapter, ..
        } = self;
        drop(adapter);
        channels.shutdown();
        log::debug!("gateway is shut down");
    }

    /// Answer the single `IsServerReady` query on the rendezvous channel.
    /// Errors assembling the response become the reply payload.
    fn run_startup_loop(&mut self) -> Result<()> {
        let adapter = &self.adapter;
        self.channels.serve_startup(|| {
            let tracing_enabled = adapter.is_tracing_enabled();
            let nixl_metadata = if adapter.is_disaggregated_transfer_enabled() {
                Some(
                    adapter
                        .own_transfer_metadata()
                        .context("collecting transfer metadata")?,
                )
            } else {
                None
            };
            Ok(StartupResponse {
                tracing_enabled,
                nixl_metadata,
            })
        })
    }

    /// Core busy loop of the engine.
    fn run_engine_loop(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                log::info!("interrupt received; leaving engine loop");
                return Ok(());
            }

            if !self.adapter.has_pending_work() && self.staged.is_empty() {
                log::debug!("no unfinished requests");
                // Poll until there is work to do, reporting health and
                // flushing stats on every timeout.
                loop {
                    if self.channels.wait_for_input(self.config.poll_timeout_ms)? {
                        break;
                    }
                    if self.cancel.is_cancelled() {
                        log::info!("interrupt received; leaving engine loop");
                        return Ok(());
                    }
                    self.health_check();
                    self.adapter.log_stats();
                    log::debug!("waiting for new requests in engine loop");
                }
            }

            // Handle any input from the client.
            self.handle_new_input()?;

            // Engine step.
            let outputs = self.engine_step()?;

            // Send request outputs (with overlap, done by the step hook).
            if !self.config.overlap_io {
                publish_outputs(&self.channels, outputs)?;
            }

            // Forward prefill hand-offs the engine fired during this tick.
            self.prefill.pump(&self.channels)?;
        }
    }

    /// Drain and dispatch everything queued on INPUT. Any error escaping this
    /// pass is fatal: it latches, is broadcast, and unwinds the loop.
    fn handle_new_input(&mut self) -> Result<()> {
        if let Err(e) = self.try_handle_new_input() {
            return Err(self.fail_fatal(e));
        }
        Ok(())
    }

    fn try_handle_new_input(&mut self) -> Result<()> {
        // Peer registrations are drained opportunistically before the pass.
        let Self {
            prefill,
            channels,
            adapter,
            ..
        } = self;
        prefill.drain_peer_metadata(channels, adapter.as_mut())?;

        while let Some(frames) = self.next_input_frames()? {
            self.dispatch(frames)?;
        }
        Ok(())
    }

    /// Frames staged by the overlap hook are dispatched before new ones are
    /// pulled off the socket, preserving arrival order.
    fn next_input_frames(&mut self) -> Result<Option<InputFrames>> {
        if let Some(frames) = self.staged.pop_front() {
            return Ok(Some(frames));
        }
        self.channels.try_recv_input()
    }

    fn dispatch(&mut self, frames: InputFrames) -> Result<()> {
        let mut frames = frames.into_iter();
        let head = frames.next().context("empty input message")?;
        // The request union is closed; a frame that matches no tag is a
        // protocol error and treated as fatal by the caller.
        let request: EngineRequest =
            protocols::decode(&head).context("unrecognized input frame")?;

        match request {
            EngineRequest::Process(mut process) => {
                // A trailing frame carries the opaque sampling-hook payload.
                process.sampling_hooks = frames.next();
                self.handle_process_request(process)
            }
            EngineRequest::Abort(abort) => {
                self.adapter.abort(&abort.request_id);
                if self.config.log_requests {
                    log::info!("Aborted request {}.", abort.request_id);
                }
                Ok(())
            }
            EngineRequest::StartProfile => self.adapter.start_profile(),
            EngineRequest::StopProfile => self.adapter.stop_profile(),
            EngineRequest::LoadAdapter(load) => self.handle_load_adapter_request(load),
            EngineRequest::ResetMultiModalCache => self.adapter.reset_multimodal_cache(),
            EngineRequest::ResetPrefixCache(reset) => {
                self.adapter.reset_prefix_cache(reset.device);
                Ok(())
            }
            EngineRequest::Sleep { level } => self.adapter.sleep(level),
            EngineRequest::WakeUp(wake) => self.adapter.wake_up(wake.tags),
            EngineRequest::IsSleeping(query) => {
                let is_sleeping = self.adapter.is_sleeping();
                self.channels.send_response(&EngineResponse::IsSleeping {
                    request_id: query.request_id,
                    is_sleeping,
                })
            }
        }
    }

    /// Admit a [`ProcessRequest`], installing the remote-prefill callback
    /// when asked for. Admission failures are scoped to the request.
    fn handle_process_request(&mut self, request: ProcessRequest) -> Result<()> {
        let request_id = request.request_id.clone();

        if self.errored_with.is_some() {
            // The engine is already dead; answer instead of admitting.
            let dead = anyhow::Error::new(self.dead_error());
            let response = self.error_response(Some(request_id), true, &dead);
            return self.channels.send_response(&response);
        }

        let binding = request
            .remote_prefill
            .as_ref()
            .filter(|params| params.is_remote_prefill)
            .map(|params| self.prefill.bind_request(params.clone()));

        match self.adapter.admit(request, binding) {
            Ok(()) => {
                if self.config.log_requests {
                    log::info!("Added request {request_id}.");
                }
                Ok(())
            }
            Err(e) => {
                // The failure is an issue with this request, not with the
                // engine itself, so the fatal latch stays untouched.
                log::debug!("failed to add request {request_id} to engine: {e:#}");
                let is_engine_errored = self.errored_with.is_some();
                let response = self.error_response(Some(request_id.clone()), is_engine_errored, &e);
                self.channels.send_response(&response)?;
                // Scrub any partial state the engine may hold for this id.
                self.adapter.abort(&request_id);
                Ok(())
            }
        }
    }

    fn handle_load_adapter_request(&mut self, request: LoadAdapterRequest) -> Result<()> {
        if let Err(e) = self.adapter.load_adapter(request.lora) {
            let response = self.error_response(Some(request.request_id), false, &e);
            return self.channels.send_response(&response);
        }
        self.channels.send_response(&EngineResponse::AdapterLoaded {
            request_id: request.request_id,
        })
    }

    /// Engine step wrapper with error handling.
    fn engine_step(&mut self) -> Result<Vec<RequestOutput>> {
        match self.step_adapter() {
            Ok(outputs) => Ok(outputs),
            Err(StepError::Request { request_id, source }) => {
                // Preparing the batch failed for a single request; that
                // request is dropped from the step and reported, the engine
                // remains usable.
                let response = self.error_response(Some(request_id), false, &source);
                self.channels.send_response(&response)?;
                Ok(Vec::new())
            }
            Err(StepError::Engine(e)) => Err(self.fail_fatal(e)),
        }
    }

    fn step_adapter(&mut self) -> Result<Vec<RequestOutput>, StepError> {
        if !self.config.overlap_io {
            return self.adapter.step(None);
        }

        let Self {
            adapter,
            channels,
            staged,
            ..
        } = self;

        // Lend the engine the publication hook for the duration of this step.
        // Channel failures inside the hook are surfaced once the step returns.
        let mut hook_error: Option<anyhow::Error> = None;
        let mut hook = |outputs: Vec<RequestOutput>| {
            if hook_error.is_some() {
                return;
            }
            if let Err(e) = publish_outputs(channels, outputs) {
                hook_error = Some(e);
                return;
            }
            loop {
                match channels.try_recv_input() {
                    Ok(Some(frames)) => staged.push_back(frames),
                    Ok(None) => break,
                    Err(e) => {
                        hook_error = Some(e);
                        break;
                    }
                }
            }
        };

        let result = adapter.step(Some(&mut hook));
        if let Some(e) = hook_error {
            return Err(StepError::Engine(e));
        }
        result
    }

    /// Send a heartbeat reflecting current health. Once latched, probes
    /// report the stored cause without re-invoking the engine.
    fn health_check(&mut self) {
        if let Some(cause) = &self.errored_with {
            let serialized = self.serialize_error(cause.as_ref());
            self.channels.send_unhealthy(&serialized);
            return;
        }

        match self.adapter.check_health() {
            Ok(()) => self.channels.send_healthy(),
            Err(e) => {
                log::error!("engine health check failed: {e:#}");
                let cause = Arc::new(e);
                self.errored_with = Some(cause.clone());
                let serialized = self.serialize_error(cause.as_ref());
                self.channels.send_unhealthy(&serialized);
            }
        }
    }

    /// Latch the fatal cause (first one wins), broadcast it to every client,
    /// mark the heartbeat unhealthy, and hand back the error that unwinds the
    /// control loop.
    fn fail_fatal(&mut self, error: anyhow::Error) -> anyhow::Error {
        let cause = match self.errored_with.take() {
            Some(existing) => {
                log::debug!("suppressing subsequent fatal error: {error:#}");
                existing
            }
            None => Arc::new(error),
        };
        self.errored_with = Some(cause.clone());

        let serialized = self.serialize_error(cause.as_ref());
        let broadcast = EngineResponse::Error(ErrorResponse {
            request_id: None,
            is_engine_errored: true,
            error: serialized.clone(),
        });
        if let Err(e) = self.channels.send_response(&broadcast) {
            log::error!("failed to broadcast fatal error: {e:#}");
        }
        self.channels.send_unhealthy(&serialized);

        anyhow::Error::new(LatchedError(cause))
    }

    fn dead_error(&self) -> EngineDeadError {
        EngineDeadError {
            cause: self.errored_with.as_ref().map(|e| format!("{e:#}")),
        }
    }

    fn error_response(
        &self,
        request_id: Option<String>,
        is_engine_errored: bool,
        error: &anyhow::Error,
    ) -> EngineResponse {
        EngineResponse::Error(ErrorResponse {
            request_id,
            is_engine_errored,
            error: self.serialize_error(error),
        })
    }

    /// Distributed-executor failures are unwrapped to their underlying cause
    /// when the capability was selected at construction; otherwise errors
    /// serialize as-is.
    fn serialize_error(&self, error: &anyhow::Error) -> SerializedError {
        if self.config.unwrap_distributed_errors {
            if let Some(remote) = error.downcast_ref::<RemoteTaskError>() {
                let cause: &(dyn std::error::Error + 'static) = remote.cause.as_ref();
                return SerializedError::from_std(cause);
            }
        }
        SerializedError::from_error(error)
    }
}

/// Publish a batch of outputs. An empty payload is a no-op.
fn publish_outputs(channels: &ChannelSet, outputs: Vec<RequestOutput>) -> Result<()> {
    if outputs.is_empty() {
        return Ok(());
    }
    channels.send_response(&EngineResponse::Outputs(outputs))
}

/// The latched fatal cause as it unwinds the loop: clonable, displays as the
/// original error.
#[derive(Debug, Clone)]
struct LatchedError(Arc<anyhow::Error>);

impl std::fmt::Display for LatchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "{:#}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::error::Error for LatchedError {}

/// Run the gateway under a [`genmux_runtime::Runtime`].
///
/// The control loop occupies one blocking thread for the lifetime of the
/// process; the runtime's primary token is its interrupt path, so the
/// `Worker` signal handler shuts it down cleanly.
pub async fn serve(
    runtime: genmux_runtime::Runtime,
    config: GatewayConfig,
    adapter: Box<dyn EngineAdapter>,
    engine_alive: Arc<AtomicBool>,
) -> Result<()> {
    let cancel = runtime.primary_token();
    tokio::task::spawn_blocking(move || run_gateway(config, adapter, cancel, engine_alive))
        .await
        .context("gateway thread panicked")?
}

/// Supervisor entrypoint: build a [`Gateway`] and run it to completion.
///
/// `engine_alive` is the supervisor's liveness flag; it is cleared on any
/// fatal, unrecovered exit. Cancelling `cancel` is the interrupt path and
/// produces a clean shutdown.
pub fn run_gateway(
    config: GatewayConfig,
    adapter: Box<dyn EngineAdapter>,
    cancel: CancellationToken,
    engine_alive: Arc<AtomicBool>,
) -> Result<()> {
    let gateway = match Gateway::new(config, adapter, cancel) {
        Ok(gateway) => gateway,
        Err(e) => {
            engine_alive.store(false, Ordering::SeqCst);
            return Err(e);
        }
    };

    match gateway.run() {
        Ok(()) => Ok(()),
        Err(e) => {
            engine_alive.store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}
