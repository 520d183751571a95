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

//! GenMux request gateway.
//!
//! The gateway is the multiplexed inter-process front end for a long-running,
//! stepwise generation engine. It runs a control loop in its own process that
//! accepts asynchronous work from client processes over a small set of
//! dedicated zmq channels, drives the engine through repeated execution steps
//! via the [`engine::EngineAdapter`] contract, and streams back results,
//! health signals and KV utilization metrics.
//!
//! For disaggregated serving, the gateway also carries the side-protocol that
//! lets two engine instances exchange memory-registration metadata and hand
//! off in-flight requests between a prefill producer and a decode consumer
//! (see [`prefill`]).

mod config;
pub use config::GatewayConfig;

pub mod engine;
pub mod gateway;
pub mod ipc;
pub mod kv_stats;
pub mod prefill;
pub mod protocols;

pub use gateway::{run_gateway, serve, Gateway};
