/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::KernelError;
use crate::common::TcpFlowFlags;

// the kernel keeps a 32-bit counter plus an overflow word per flow
pub const BYTES_COUNTER_BITS: u32 = 48;
pub const PACKETS_COUNTER_BITS: u32 = 40;

/// Raw counters of one kernel flow entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelFlowStats {
    pub bytes: u32,
    pub bytes_oflow: u16,
    pub packets: u32,
    pub packets_oflow: u8,
    pub tcp_flags: TcpFlowFlags,
    pub udp_src_port: u16,
}

impl KernelFlowStats {
    /// Builds an entry from full counter values, truncated to the kernel widths.
    pub fn with_counters(bytes: u64, packets: u64) -> Self {
        Self {
            bytes: bytes as u32,
            bytes_oflow: (bytes >> 32) as u16,
            packets: packets as u32,
            packets_oflow: (packets >> 32) as u8,
            ..Default::default()
        }
    }

    pub fn bytes(&self) -> u64 {
        (self.bytes_oflow as u64) << 32 | self.bytes as u64
    }

    pub fn packets(&self) -> u64 {
        (self.packets_oflow as u64) << 32 | self.packets as u64
    }
}

/// Synchronous access to the kernel flow table.
pub trait KernelFlowTable: Send {
    fn read_kernel_counters(&self, flow_handle: u32) -> Result<KernelFlowStats, KernelError>;
}

impl<T: KernelFlowTable + Sync> KernelFlowTable for Arc<T> {
    fn read_kernel_counters(&self, flow_handle: u32) -> Result<KernelFlowStats, KernelError> {
        self.as_ref().read_kernel_counters(flow_handle)
    }
}

/// Kernel flow table kept in process memory.
///
/// Used where no forwarding plane is attached, and to drive the collector
/// deterministically.
#[derive(Default)]
pub struct MemoryKernelTable {
    entries: Mutex<HashMap<u32, Result<KernelFlowStats, KernelError>>>,
}

impl MemoryKernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow_handle: u32, stats: KernelFlowStats) {
        self.entries.lock().insert(flow_handle, Ok(stats));
    }

    pub fn set_counters(&self, flow_handle: u32, bytes: u64, packets: u64) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(flow_handle)
            .or_insert_with(|| Ok(KernelFlowStats::default()));
        let prev = entry.as_ref().copied().unwrap_or_default();
        *entry = Ok(KernelFlowStats {
            tcp_flags: prev.tcp_flags,
            udp_src_port: prev.udp_src_port,
            ..KernelFlowStats::with_counters(bytes, packets)
        });
    }

    /// Adds traffic to an entry, wrapping at the kernel counter widths.
    pub fn add_traffic(&self, flow_handle: u32, bytes: u64, packets: u64) {
        let (cur_bytes, cur_packets) = match self.entries.lock().get(&flow_handle) {
            Some(Ok(s)) => (s.bytes(), s.packets()),
            _ => (0, 0),
        };
        self.set_counters(
            flow_handle,
            cur_bytes.wrapping_add(bytes) & ((1 << BYTES_COUNTER_BITS) - 1),
            cur_packets.wrapping_add(packets) & ((1 << PACKETS_COUNTER_BITS) - 1),
        );
    }

    pub fn update<F: FnOnce(&mut KernelFlowStats)>(&self, flow_handle: u32, f: F) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(flow_handle)
            .or_insert_with(|| Ok(KernelFlowStats::default()));
        let mut stats = entry.as_ref().copied().unwrap_or_default();
        f(&mut stats);
        *entry = Ok(stats);
    }

    /// Makes reads of `flow_handle` fail until the entry is set again.
    pub fn fail(&self, flow_handle: u32, error: KernelError) {
        self.entries.lock().insert(flow_handle, Err(error));
    }

    pub fn remove(&self, flow_handle: u32) {
        self.entries.lock().remove(&flow_handle);
    }
}

impl KernelFlowTable for MemoryKernelTable {
    fn read_kernel_counters(&self, flow_handle: u32) -> Result<KernelFlowStats, KernelError> {
        match self.entries.lock().get(&flow_handle) {
            Some(r) => r.clone(),
            None => Err(KernelError::NotFound(flow_handle)),
        }
    }
}
