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

//! The [`Runtime`] holds the primary [`CancellationToken`] for the process.
//! Cancelling it is the single interrupt path observed by the gateway control
//! loop and by every background task spawned from this runtime.

use super::{config, Result, Runtime, RuntimeType};

pub use tokio_util::sync::CancellationToken;

impl Runtime {
    fn new(primary: RuntimeType) -> Result<Runtime> {
        Ok(Runtime {
            id: std::sync::Arc::new(uuid::Uuid::new_v4().to_string()),
            primary,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Build a [`Runtime`] from the tokio runtime the caller is already inside.
    pub fn from_current() -> Result<Runtime> {
        Runtime::from_handle(tokio::runtime::Handle::current())
    }

    pub fn from_handle(handle: tokio::runtime::Handle) -> Result<Runtime> {
        Runtime::new(RuntimeType::External(handle))
    }

    /// Create a [`Runtime`] from [`config::RuntimeConfig::from_settings`].
    pub fn from_settings() -> Result<Runtime> {
        let config = config::RuntimeConfig::from_settings()?;
        let owned = RuntimeType::Shared(std::sync::Arc::new(config.create_runtime()?));
        Runtime::new(owned)
    }

    /// Create a [`Runtime`] with a single-threaded tokio runtime.
    pub fn single_threaded() -> Result<Runtime> {
        let config = config::RuntimeConfig::single_threaded();
        let owned = RuntimeType::Shared(std::sync::Arc::new(config.create_runtime()?));
        Runtime::new(owned)
    }

    /// Unique identifier of this runtime instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle to the thread pool backing this runtime.
    pub fn primary(&self) -> tokio::runtime::Handle {
        self.primary.handle()
    }

    /// Access the primary [`CancellationToken`].
    pub fn primary_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Create a child [`CancellationToken`] tied to the runtime's lifetime.
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Cancel the primary token, shutting down everything attached to it.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

impl RuntimeType {
    pub fn handle(&self) -> tokio::runtime::Handle {
        match self {
            RuntimeType::External(handle) => handle.clone(),
            RuntimeType::Shared(rt) => rt.handle().clone(),
        }
    }
}

impl std::fmt::Debug for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::External(_) => write!(f, "RuntimeType::External"),
            RuntimeType::Shared(_) => write!(f, "RuntimeType::Shared"),
        }
    }
}
