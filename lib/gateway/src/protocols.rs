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

//! Wire protocol for the gateway's channel set.
//!
//! Every frame crossing a gateway channel is a MessagePack encoding of one of
//! the types in this module. The INPUT and OUTPUT channels carry the two
//! closed unions [`EngineRequest`] and [`EngineResponse`]; the remaining
//! channels carry exactly one payload type each (see the channel table in the
//! crate documentation).

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Token ids as they appear on the wire and in engine prompts.
pub type TokenIdType = u32;

/// Encode a protocol value into a MessagePack frame.
///
/// Field names are written out, so frames stay self-describing and tolerant
/// to optional-field evolution on either side of the channel.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decode a MessagePack frame into a protocol value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

/// A prompt as submitted by the client. Engines that only accept token ids
/// are expected to reject `Text` prompts at admission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    Text(String),
    Tokens(Vec<TokenIdType>),
}

/// Options that control sampling and termination for one request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    /// Controls the randomness of the sampling. Zero means greedy sampling.
    pub temperature: Option<f32>,

    /// Cumulative probability of the top tokens to consider. Must be in
    /// (0, 1]. Set to 1 to consider all tokens.
    pub top_p: Option<f32>,

    /// Number of top tokens to consider. Set to -1 to consider all tokens.
    pub top_k: Option<i32>,

    /// Minimum probability for a token to be considered, relative to the
    /// probability of the most likely token.
    pub min_p: Option<f32>,

    /// Penalizes new tokens based on whether they appear in the generated
    /// text so far.
    pub presence_penalty: Option<f32>,

    /// Penalizes new tokens based on their frequency in the generated text
    /// so far.
    pub frequency_penalty: Option<f32>,

    /// Penalizes new tokens based on whether they appear in the prompt and
    /// the generated text so far.
    pub repetition_penalty: Option<f32>,

    /// The seed to use when sampling.
    pub seed: Option<i64>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// The minimum number of tokens to generate.
    pub min_tokens: Option<u32>,

    /// Strings that stop the generation when they are generated.
    pub stop: Option<Vec<String>>,

    /// Tokens that stop the generation when they are generated.
    pub stop_token_ids: Option<Vec<TokenIdType>>,

    /// Whether to continue generating after the EOS token is produced.
    pub ignore_eos: Option<bool>,

    /// Number of log probabilities to return per output token.
    pub logprobs: Option<u32>,
}

/// Identifies a LoRA adapter the engine should apply to a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoraDescriptor {
    pub name: String,
    pub id: i64,
    pub path: String,
}

/// Identifies a prompt adapter the engine should apply to a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PromptAdapterDescriptor {
    pub name: String,
    pub id: i64,
    pub path: String,
}

/// Remote prefill parameters carried by a [`ProcessRequest`].
///
/// The per-request callback that forwards the hand-off to the peer engine is
/// installed gateway-side and never crosses a channel.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RemotePrefillParams {
    /// Prompt processing for this request must be served by a remote peer.
    #[serde(default)]
    pub is_remote_prefill: bool,

    /// This request's generated tokens are consumed by a remote decoder.
    #[serde(default)]
    pub is_remote_decode: bool,

    pub decode_block_ids: Option<Vec<u64>>,
    pub decode_computed_block_ids: Option<Vec<u64>>,
    pub decode_engine_id: Option<String>,
}

/// Submit a prompt for generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    /// Caller-supplied id, unique among in-flight requests.
    pub request_id: String,

    pub prompt: Prompt,

    pub params: SamplingParams,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_headers: Option<HashMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_adapter: Option<PromptAdapterDescriptor>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_prefill: Option<RemotePrefillParams>,

    /// Opaque sampling-time hook payload carried as a second, separately
    /// encoded frame on the INPUT channel. The gateway attaches it untouched;
    /// only the engine interprets it.
    #[serde(skip)]
    pub sampling_hooks: Option<Vec<u8>>,
}

/// Best-effort, fire-and-forget cancellation of an in-flight request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AbortRequest {
    pub request_id: String,
}

/// Target device for a prefix-cache reset.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Gpu,
    Cpu,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResetPrefixCacheRequest {
    pub device: Device,
}

/// How deeply the engine should release resources while sleeping.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SleepLevel {
    /// Offload weights, keep allocations.
    Level1,
    /// Discard both weights and KV allocations.
    Level2,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WakeUpRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IsSleepingRequest {
    pub request_id: String,
}

impl Default for IsSleepingRequest {
    fn default() -> Self {
        IsSleepingRequest {
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadAdapterRequest {
    pub lora: LoraDescriptor,
    pub request_id: String,
}

impl LoadAdapterRequest {
    /// Build a load request with a fresh UUID request id.
    pub fn new(lora: LoraDescriptor) -> Self {
        LoadAdapterRequest {
            lora,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// The INPUT channel union. Closed and exhaustively matched by the gateway
/// dispatcher; a frame that decodes to none of these is a protocol error and
/// fatal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EngineRequest {
    Process(ProcessRequest),
    Abort(AbortRequest),
    StartProfile,
    StopProfile,
    LoadAdapter(LoadAdapterRequest),
    ResetMultiModalCache,
    ResetPrefixCache(ResetPrefixCacheRequest),
    Sleep { level: SleepLevel },
    WakeUp(WakeUpRequest),
    IsSleeping(IsSleepingRequest),
}

/// Why a sequence stopped generating.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
    Error,
}

/// One generated sequence for a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompletionOutput {
    pub index: u32,
    pub text: String,
    pub token_ids: Vec<TokenIdType>,
    pub cumulative_logprob: Option<f64>,
    pub finish_reason: Option<FinishReason>,
}

/// Incremental or terminal output for one request. `finished` marks the
/// terminal message; exactly one is emitted per admitted request unless a
/// broadcast fatal error supersedes it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestOutput {
    pub request_id: String,
    pub outputs: Vec<CompletionOutput>,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_cached_tokens: Option<u32>,
}

/// A flattened error suitable for crossing a process boundary: the top-level
/// message plus the messages of the `source()` chain beneath it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SerializedError {
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

impl SerializedError {
    pub fn from_error(error: &anyhow::Error) -> Self {
        SerializedError {
            message: error.to_string(),
            chain: error.chain().skip(1).map(|c| c.to_string()).collect(),
        }
    }

    pub fn from_std(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        SerializedError {
            message: error.to_string(),
            chain,
        }
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.chain {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// Error report on the OUTPUT channel.
///
/// `request_id = None` marks a broadcast fatal error superseding all in-flight
/// requests. `is_engine_errored` reports the one-shot fatal latch; once a
/// client observes it true, the engine never recovers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_id: Option<String>,
    pub is_engine_errored: bool,
    pub error: SerializedError,
}

/// The OUTPUT channel union.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EngineResponse {
    Outputs(Vec<RequestOutput>),
    AdapterLoaded { request_id: String },
    IsSleeping { request_id: String, is_sleeping: bool },
    Error(ErrorResponse),
}

/// Heartbeat payload on the HEALTH channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy(SerializedError),
}

/// The single query a client may issue on the rendezvous channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupRequest {
    IsServerReady,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartupResponse {
    pub tracing_enabled: bool,

    /// The engine's own memory-registration metadata, already encoded, when
    /// disaggregated transfer is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nixl_metadata: Option<Vec<u8>>,
}

/// Rendezvous reply: either the startup response or the error that occurred
/// while assembling it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupReply {
    Ready(StartupResponse),
    Error(SerializedError),
}

/// Periodic KV capacity/utilization snapshot on the METRICS channel.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct KvMetrics {
    pub request_active_slots: u64,
    pub request_total_slots: u64,
    pub kv_active_blocks: u64,
    pub kv_total_blocks: u64,
    pub num_requests_waiting: u64,
    pub gpu_cache_usage_perc: f32,
    pub gpu_prefix_cache_hit_rate: f32,
}

/// Hand-off of one request's prompt processing to a remote peer engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemotePrefillRequest {
    pub engine_id: String,
    pub request_id: String,
    pub prompt_token_ids: Vec<TokenIdType>,
    pub sampling_params: SamplingParams,
    pub block_ids: Vec<u64>,
    pub computed_block_ids: Vec<u64>,
}

/// A peer engine's memory-registration metadata, as it arrives on the
/// REMOTE_NIXL_METADATA channel. Registration is keyed by `engine_id` and is
/// additive over the process lifetime.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NixlAgentMetadata {
    pub engine_id: String,
    pub agent_metadata: Vec<Vec<u8>>,
    pub kv_caches_base_addr: Vec<u64>,
    pub num_blocks: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryOp {
    Read,
    Write,
}

/// Reserved wire message for the adapter-owned data plane. Defined here so
/// both sides of the disaggregated pair agree on the layout; the gateway
/// itself never produces or consumes it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MemoryTransferRequest {
    pub request_id: String,
    pub local_block_ids: Vec<u64>,
    pub staging_block_ids: Vec<u64>,
    pub remote_block_ids: Vec<u64>,
    pub remote_engine_id: String,
    pub notify_msg: String,
    pub op_type: MemoryOp,
}
