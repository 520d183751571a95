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

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Gateway configuration.
///
/// Loaded from `GENMUX_GATEWAY_`-prefixed environment variables on top of the
/// defaults below, or assembled programmatically through the builder.
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
pub struct GatewayConfig {
    /// Base endpoint for the channel set, e.g. `ipc:///tmp/genmux`. Each
    /// channel binds this path plus its own suffix.
    #[builder(setter(into))]
    pub ipc_path: String,

    /// Overlap channel IO with the compute step: the adapter publishes
    /// outputs and drains new input via a callback invoked inside `step`.
    #[builder(default = "false")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub overlap_io: bool,

    /// Log request admission and abort at info level.
    #[builder(default = "true")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub log_requests: bool,

    /// How long an idle INPUT poll blocks before emitting a heartbeat and a
    /// stats flush, in milliseconds.
    #[validate(range(min = 1))]
    #[builder(default = "10_000")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub poll_timeout_ms: u64,

    /// Unwrap errors raised by a distributed executor backend to their
    /// underlying cause before publication. Enable only when the engine runs
    /// on such a backend.
    #[builder(default = "false")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub unwrap_distributed_errors: bool,
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Load the gateway configuration for `ipc_path` from the environment.
    pub fn from_settings(ipc_path: impl Into<String>) -> Result<GatewayConfig> {
        let defaults = GatewayConfig::builder().ipc_path(ipc_path).build()?;
        let config: GatewayConfig = Figment::new()
            .merge(Serialized::defaults(defaults))
            .merge(Env::prefixed("GENMUX_GATEWAY_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }
}

impl GatewayConfigBuilder {
    /// Build and validate the gateway configuration.
    pub fn build(&self) -> Result<GatewayConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}
