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

//! The [`Worker`] is a convenience wrapper around the construction of the
//! [`Runtime`] and execution of the user's application.
//!
//! [`Worker::execute`] is designed to be called once from main and blocks the
//! calling thread until the application completes or is canceled. It installs
//! the signal handler that traps `SIGINT` and `SIGTERM` and translates them
//! into a cancellation of the [`Runtime`]'s primary token, which is the
//! interrupt path observed by the gateway control loop.
//!
//! On termination the application is given a graceful shutdown period
//! controlled by the `GENMUX_WORKER_GRACEFUL_SHUTDOWN_TIMEOUT` environment
//! variable (see [`WorkerConfig`]). If the application does not shut down in
//! time, the worker terminates the process with an exit code of 911.

use super::{error, CancellationToken, Result, Runtime, RuntimeConfig, WorkerConfig};

use futures::Future;
use once_cell::sync::OnceCell;
use std::time::Duration;
use tokio::{signal, task::JoinHandle};
use tracing as log;

static RT: OnceCell<tokio::runtime::Runtime> = OnceCell::new();

const SHUTDOWN_MESSAGE: &str =
    "Worker received shutdown signal; attempting to gracefully shutdown";
const SHUTDOWN_TIMEOUT_MESSAGE: &str =
    "Use GENMUX_WORKER_GRACEFUL_SHUTDOWN_TIMEOUT to control the graceful shutdown timeout";

pub struct Worker {
    runtime: Runtime,
}

impl Worker {
    /// Create a new [`Worker`] from [`RuntimeConfig`] settings sourced from the environment.
    pub fn from_settings() -> Result<Worker> {
        let config = RuntimeConfig::from_settings()?;
        Worker::from_config(config)
    }

    /// Create a new [`Worker`] from a provided [`RuntimeConfig`].
    pub fn from_config(config: RuntimeConfig) -> Result<Worker> {
        // if the runtime is already initialized, return an error
        if RT.get().is_some() {
            return Err(error!("Worker already initialized"));
        }

        // there is still a potential race here: two threads could have passed
        // the first check, but only one will succeed in inserting the runtime
        let rt = RT.try_insert(config.create_runtime()?).map_err(|_| {
            error!("Failed to create worker; Only a single Worker should ever be created")
        })?;

        let runtime = Runtime::from_handle(rt.handle().clone())?;
        Ok(Worker { runtime })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Executes the provided application/closure on the [`Runtime`].
    /// This is designed to be called once from main and will block the calling
    /// thread until the application completes.
    pub fn execute<F, Fut>(self, f: F) -> Result<()>
    where
        F: FnOnce(Runtime) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let rt = RT.get().ok_or_else(|| error!("Worker not initialized"))?;

        let runtime = self.runtime;
        let cancel_token = runtime.primary_token();
        let timeout = WorkerConfig::from_settings().graceful_shutdown_timeout;

        let result = rt.block_on(async move {
            tokio::spawn(signal_handler(cancel_token.clone()));

            let mut task: JoinHandle<Result<()>> = tokio::spawn(f(runtime));

            let joined = tokio::select! {
                joined = &mut task => joined,

                _ = cancel_token.cancelled() => {
                    eprintln!("{}", SHUTDOWN_MESSAGE);
                    eprintln!("{} {} seconds", SHUTDOWN_TIMEOUT_MESSAGE, timeout);

                    match tokio::time::timeout(Duration::from_secs(timeout), &mut task).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            eprintln!("Application did not shutdown in time; terminating");
                            std::process::exit(911);
                        }
                    }
                }
            };

            joined.map_err(|e| error!("Application task panicked: {e}"))?
        });

        match &result {
            Ok(_) => {
                log::info!("Application shutdown successfully");
            }
            Err(e) => {
                log::error!("Application shutdown with error: {:?}", e);
            }
        }

        result
    }
}

/// Catch signals and trigger a shutdown
async fn signal_handler(cancel_token: CancellationToken) -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await?;
        anyhow::Ok(())
    };

    let sigterm = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        anyhow::Ok(())
    };

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = sigterm => {
            log::info!("SIGTERM received, starting graceful shutdown");
        },
        _ = cancel_token.cancelled() => {
            log::info!("CancellationToken triggered; shutting down");
        },
    }

    // trigger a shutdown
    cancel_token.cancel();

    Ok(())
}
