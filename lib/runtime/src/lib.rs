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

//! GenMux process runtime.
//!
//! This crate owns the pieces of a GenMux process that sit outside the gateway
//! control loop itself: construction of the tokio runtime, the process-wide
//! [`CancellationToken`] that translates termination signals into the control
//! loop's interrupt path, logging initialization and runtime configuration.

use std::sync::Arc;

pub use anyhow::{anyhow as error, Context as ErrorContext, Error, Result};

mod config;
pub use config::{RuntimeConfig, WorkerConfig};

pub mod logging;
pub mod runtime;
pub mod worker;

pub use tokio_util::sync::CancellationToken;
pub use worker::Worker;

/// Types of tokio runtimes that can back a [`Runtime`].
#[derive(Clone)]
enum RuntimeType {
    Shared(Arc<tokio::runtime::Runtime>),
    External(tokio::runtime::Handle),
}

/// Per-process runtime handle.
///
/// Provides access to the thread pool and the primary [`CancellationToken`]
/// that governs the lifetime of everything attached to this process.
#[derive(Debug, Clone)]
pub struct Runtime {
    id: Arc<String>,
    primary: RuntimeType,
    cancellation_token: CancellationToken,
}
