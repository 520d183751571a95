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

//! A scripted engine for driving the gateway in tests.
//!
//! Behavior is keyed off request-id prefixes so tests stay declarative:
//! `reject-*` fails admission, `poison-*` fails batch preparation for that
//! request, `fatal-*` kills the whole step.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};

use genmux_gateway::engine::{
    EngineAdapter, EngineCapacity, OutputHook, SchedulerStats, StatSink, StepError,
};
use genmux_gateway::prefill::RemotePrefillBinding;
use genmux_gateway::protocols::{
    self, CompletionOutput, Device, FinishReason, LoraDescriptor, NixlAgentMetadata,
    ProcessRequest, Prompt, RemotePrefillRequest, RequestOutput, SleepLevel,
};

pub const MOCK_REQUEST_SLOTS: u64 = 8;
pub const MOCK_KV_BLOCKS: u64 = 1024;

/// Everything the tests want to assert on afterwards.
#[derive(Default)]
pub struct MockState {
    pub admitted: Vec<String>,
    pub completed: Vec<String>,
    pub aborted: Vec<String>,
    pub prefix_cache_resets: Vec<Device>,
    pub multimodal_cache_resets: u32,
    pub profile_starts: u32,
    pub profile_stops: u32,
    pub sleeping: bool,
    pub wake_tags: Vec<String>,
    pub loaded_adapters: Vec<String>,
    pub registered_peers: Vec<String>,
    pub steps: u32,
    pub hooked_steps: u32,
}

struct Pending {
    request: ProcessRequest,
    _prefill: Option<RemotePrefillBinding>,
}

pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    queue: VecDeque<Pending>,
    sinks: Vec<(String, Box<dyn StatSink>)>,
    engine_id: String,
    disaggregated: bool,
    fail_health: bool,
}

impl MockEngine {
    pub fn new() -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let engine = MockEngine {
            state: state.clone(),
            queue: VecDeque::new(),
            sinks: Vec::new(),
            engine_id: "mock-engine-0".to_string(),
            disaggregated: false,
            fail_health: false,
        };
        (engine, state)
    }

    pub fn disaggregated(mut self) -> Self {
        self.disaggregated = true;
        self
    }

    pub fn with_failing_health(mut self) -> Self {
        self.fail_health = true;
        self
    }

    fn flush_stats(&self) {
        let stats = SchedulerStats {
            num_running: self.queue.len() as u64,
            num_waiting: 0,
            gpu_cache_usage: self.queue.len() as f32 / MOCK_KV_BLOCKS as f32,
            gpu_prefix_cache_hit_rate: 0.0,
        };
        for (_, sink) in &self.sinks {
            sink.record(&stats);
        }
    }
}

impl EngineAdapter for MockEngine {
    fn has_pending_work(&self) -> bool {
        !self.queue.is_empty()
    }

    fn step(&mut self, hook: Option<OutputHook<'_>>) -> Result<Vec<RequestOutput>, StepError> {
        {
            let mut state = self.state.lock().unwrap();
            state.steps += 1;
            if hook.is_some() {
                state.hooked_steps += 1;
            }
        }

        let mut outputs = Vec::new();
        while let Some(pending) = self.queue.pop_front() {
            let request_id = pending.request.request_id.clone();
            if request_id.starts_with("fatal-") {
                return Err(StepError::Engine(anyhow!("model executor died")));
            }
            if request_id.starts_with("poison-") {
                return Err(StepError::Request {
                    request_id,
                    source: anyhow!("failed to prepare inputs"),
                });
            }

            let max_tokens = pending.request.params.max_tokens.unwrap_or(1);
            outputs.push(RequestOutput {
                request_id: request_id.clone(),
                outputs: vec![CompletionOutput {
                    index: 0,
                    text: "ok".to_string(),
                    token_ids: (0..max_tokens).collect(),
                    cumulative_logprob: None,
                    finish_reason: Some(FinishReason::Stop),
                }],
                finished: true,
                num_cached_tokens: None,
            });
            self.state.lock().unwrap().completed.push(request_id);
        }

        self.flush_stats();

        match hook {
            Some(hook) => {
                hook(outputs);
                Ok(Vec::new())
            }
            None => Ok(outputs),
        }
    }

    fn admit(
        &mut self,
        request: ProcessRequest,
        prefill: Option<RemotePrefillBinding>,
    ) -> Result<()> {
        if request.request_id.starts_with("reject-") {
            bail!("unschedulable prompt");
        }

        if let Some(binding) = &prefill {
            // A prefill producer decides immediately; hand the prompt off.
            let prompt_token_ids = match &request.prompt {
                Prompt::Tokens(tokens) => tokens.clone(),
                Prompt::Text(_) => vec![0],
            };
            binding.request_remote_prefill(RemotePrefillRequest {
                engine_id: self.engine_id.clone(),
                request_id: request.request_id.clone(),
                prompt_token_ids,
                sampling_params: request.params.clone(),
                block_ids: vec![1, 2],
                computed_block_ids: vec![1],
            });
        }

        self.state
            .lock()
            .unwrap()
            .admitted
            .push(request.request_id.clone());
        self.queue.push_back(Pending {
            request,
            _prefill: prefill,
        });
        Ok(())
    }

    fn abort(&mut self, request_id: &str) {
        self.queue
            .retain(|pending| pending.request.request_id != request_id);
        self.state
            .lock()
            .unwrap()
            .aborted
            .push(request_id.to_string());
    }

    fn check_health(&mut self) -> Result<()> {
        if self.fail_health {
            bail!("watchdog timeout");
        }
        Ok(())
    }

    fn is_tracing_enabled(&self) -> bool {
        false
    }

    fn is_disaggregated_transfer_enabled(&self) -> bool {
        self.disaggregated
    }

    fn own_transfer_metadata(&self) -> Result<Vec<u8>> {
        let metadata = NixlAgentMetadata {
            engine_id: self.engine_id.clone(),
            agent_metadata: vec![vec![0xab]],
            kv_caches_base_addr: vec![0x1000],
            num_blocks: MOCK_KV_BLOCKS,
        };
        Ok(protocols::encode(&metadata)?)
    }

    fn register_peer_metadata(&mut self, metadata: NixlAgentMetadata) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .registered_peers
            .push(metadata.engine_id);
        Ok(())
    }

    fn start_profile(&mut self) -> Result<()> {
        self.state.lock().unwrap().profile_starts += 1;
        Ok(())
    }

    fn stop_profile(&mut self) -> Result<()> {
        self.state.lock().unwrap().profile_stops += 1;
        Ok(())
    }

    fn reset_prefix_cache(&mut self, device: Device) -> bool {
        self.state.lock().unwrap().prefix_cache_resets.push(device);
        true
    }

    fn reset_multimodal_cache(&mut self) -> Result<()> {
        self.state.lock().unwrap().multimodal_cache_resets += 1;
        Ok(())
    }

    fn sleep(&mut self, _level: SleepLevel) -> Result<()> {
        self.state.lock().unwrap().sleeping = true;
        Ok(())
    }

    fn wake_up(&mut self, tags: Option<Vec<String>>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sleeping = false;
        state.wake_tags.extend(tags.unwrap_or_default());
        Ok(())
    }

    fn is_sleeping(&self) -> bool {
        self.state.lock().unwrap().sleeping
    }

    fn load_adapter(&mut self, descriptor: LoraDescriptor) -> Result<()> {
        if descriptor.name.starts_with("missing-") {
            bail!("adapter weights not found: {}", descriptor.path);
        }
        self.state.lock().unwrap().loaded_adapters.push(descriptor.name);
        Ok(())
    }

    fn capacity(&self) -> EngineCapacity {
        EngineCapacity {
            request_slots: MOCK_REQUEST_SLOTS,
            kv_blocks: MOCK_KV_BLOCKS,
        }
    }

    fn attach_stat_sink(&mut self, name: &str, sink: Box<dyn StatSink>) {
        self.sinks.push((name.to_string(), sink));
    }

    fn log_stats(&mut self) {
        self.flush_stats();
    }
}
