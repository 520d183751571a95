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

//! KV capacity/utilization publication.

use tracing as log;

use crate::engine::{SchedulerStats, StatSink};
use crate::ipc::MetricsChannel;
use crate::protocols::KvMetrics;

/// Derives [`KvMetrics`] snapshots from engine statistics and emits them on
/// the METRICS channel.
///
/// Capacities are fixed at construction; the construction itself emits a
/// zeroed snapshot so subscribers learn the capacity bounds before the first
/// real step.
pub struct KvStatPublisher {
    request_total_slots: u64,
    kv_total_blocks: u64,
    channel: MetricsChannel,
}

impl KvStatPublisher {
    pub fn new(request_total_slots: u64, kv_total_blocks: u64, channel: MetricsChannel) -> Self {
        let publisher = KvStatPublisher {
            request_total_slots,
            kv_total_blocks,
            channel,
        };
        publisher.send(0, 0, 0, 0.0, 0.0);
        publisher
    }

    fn send(
        &self,
        active_slots: u64,
        active_kv_blocks: u64,
        num_requests_waiting: u64,
        gpu_cache_usage_perc: f32,
        gpu_prefix_cache_hit_rate: f32,
    ) {
        let metrics = KvMetrics {
            request_active_slots: active_slots,
            request_total_slots: self.request_total_slots,
            kv_active_blocks: active_kv_blocks,
            kv_total_blocks: self.kv_total_blocks,
            num_requests_waiting,
            gpu_cache_usage_perc,
            gpu_prefix_cache_hit_rate,
        };
        log::trace!("publishing kv metrics: {metrics:?}");
        self.channel.send(&metrics);
    }
}

impl StatSink for KvStatPublisher {
    fn record(&self, stats: &SchedulerStats) {
        // Active blocks are reported as a count, derived from the utilization
        // fraction and truncated toward zero.
        let active_kv_blocks = (stats.gpu_cache_usage * self.kv_total_blocks as f32) as u64;
        self.send(
            stats.num_running,
            active_kv_blocks,
            stats.num_waiting,
            stats.gpu_cache_usage,
            stats.gpu_prefix_cache_hit_rate,
        );
    }
}
