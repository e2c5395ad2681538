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

use std::collections::{hash_map, HashMap};
use std::net::IpAddr;

use log::debug;
use uuid::Uuid;

use public::Bitmap;

use super::{flow_export_info::FlowExportInfo, flow_tree::FlowEntryTree};
use crate::common::{FlowKey, IPPROTO_TCP, IPPROTO_UDP};

pub const UNKNOWN_VN: &str = "__UNKNOWN__";

const PORTS_PER_BUCKET: usize = 256;
const PORT_BUCKETS: usize = (u16::MAX as usize + 1) / PORTS_PER_BUCKET;

fn vn_or_unknown(vn: &str) -> &str {
    if vn.is_empty() {
        UNKNOWN_VN
    } else {
        vn
    }
}

/// Traffic between a VN and one peer VN, directions relative to the vRouter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VnFlowStats {
    pub in_bytes: u64,
    pub in_packets: u64,
    pub out_bytes: u64,
    pub out_packets: u64,
}

/// Traffic accumulated per (vn, peer vn) pair.
#[derive(Debug, Default)]
pub struct InterVnStats {
    stats: HashMap<(String, String), VnFlowStats>,
}

impl InterVnStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, vn: &str, other_vn: &str, bytes: u64, packets: u64, outgoing: bool) {
        let entry = self
            .stats
            .entry((vn.to_owned(), other_vn.to_owned()))
            .or_default();
        if outgoing {
            entry.out_bytes = entry.out_bytes.saturating_add(bytes);
            entry.out_packets = entry.out_packets.saturating_add(packets);
        } else {
            entry.in_bytes = entry.in_bytes.saturating_add(bytes);
            entry.in_packets = entry.in_packets.saturating_add(packets);
        }
    }

    /// Folds the delta of a flow into the stats of its VN pair.
    ///
    /// Traffic entering the vRouter counts as `in` of the source VN, traffic
    /// leaving it as `out` of the destination VN. Local flows do both.
    pub fn update(&mut self, info: &FlowExportInfo, bytes: u64, packets: u64) {
        if bytes == 0 && packets == 0 {
            return;
        }
        let src_vn = vn_or_unknown(&info.source_vn);
        let dst_vn = vn_or_unknown(&info.dest_vn);
        if info.is_local() {
            self.add(src_vn, dst_vn, bytes, packets, false);
            self.add(dst_vn, src_vn, bytes, packets, true);
        } else if info.is_ingress() {
            self.add(src_vn, dst_vn, bytes, packets, false);
        } else {
            self.add(dst_vn, src_vn, bytes, packets, true);
        }
    }

    pub fn get(&self, vn: &str, other_vn: &str) -> Option<&VnFlowStats> {
        self.stats.get(&(vn.to_owned(), other_vn.to_owned()))
    }

    pub fn iter(&self) -> hash_map::Iter<'_, (String, String), VnFlowStats> {
        self.stats.iter()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// Interface, floating ip and VN a floating ip counter is kept for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FipStatsKey {
    pub vmi: Uuid,
    pub fip: IpAddr,
    pub vn: String,
}

/// Traffic of translated flows per floating ip.
#[derive(Debug, Default)]
pub struct FipStats {
    stats: HashMap<FipStatsKey, VnFlowStats>,
}

impl FipStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, key: FipStatsKey, bytes: u64, packets: u64, outgoing: bool) {
        let entry = self.stats.entry(key).or_default();
        if outgoing {
            entry.out_bytes = entry.out_bytes.saturating_add(bytes);
            entry.out_packets = entry.out_packets.saturating_add(packets);
        } else {
            entry.in_bytes = entry.in_bytes.saturating_add(bytes);
            entry.in_packets = entry.in_packets.saturating_add(packets);
        }
    }

    /// Folds the delta of the flow at `key` into its floating ip counters.
    ///
    /// When the reverse flow is translated to another floating ip, as for two
    /// local VMs talking through their floating ips, that one is updated too.
    /// Local flows count as `out` on the reverse direction and `in` otherwise,
    /// other flows follow their ingress flag.
    pub fn update(&mut self, tree: &FlowEntryTree, key: &FlowKey, bytes: u64, packets: u64) {
        if bytes == 0 && packets == 0 {
            return;
        }
        let Some(info) = tree.get(key) else {
            return;
        };
        let Some((fip, vmi)) = info.floating_ip() else {
            return;
        };
        let vn = vn_or_unknown(&info.source_vn).to_owned();
        let rev_fip = info
            .rev_flow_key
            .as_ref()
            .and_then(|rk| tree.get(rk))
            .and_then(|rev| rev.floating_ip())
            .filter(|(rev_ip, _)| *rev_ip != fip);

        let outgoing = if info.is_local() {
            info.is_reverse()
        } else {
            !info.is_ingress()
        };
        if let Some((rev_ip, rev_vmi)) = rev_fip {
            let rev_key = FipStatsKey {
                vmi: rev_vmi,
                fip: rev_ip,
                vn: vn.clone(),
            };
            self.add(rev_key, bytes, packets, outgoing);
        }
        self.add(FipStatsKey { vmi, fip, vn }, bytes, packets, outgoing);
    }

    pub fn get(&self, vmi: Uuid, fip: IpAddr, vn: &str) -> Option<&VnFlowStats> {
        self.stats.get(&FipStatsKey {
            vmi,
            fip,
            vn: vn.to_owned(),
        })
    }

    pub fn iter(&self) -> hash_map::Iter<'_, FipStatsKey, VnFlowStats> {
        self.stats.iter()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// TCP and UDP ports seen in new flows, one bit per bucket of ports.
#[derive(Clone, Debug)]
pub struct L4PortBitmap {
    pub tcp_sport: Bitmap,
    pub tcp_dport: Bitmap,
    pub udp_sport: Bitmap,
    pub udp_dport: Bitmap,
}

impl Default for L4PortBitmap {
    fn default() -> Self {
        Self {
            tcp_sport: Bitmap::new(PORT_BUCKETS, false),
            tcp_dport: Bitmap::new(PORT_BUCKETS, false),
            udp_sport: Bitmap::new(PORT_BUCKETS, false),
            udp_dport: Bitmap::new(PORT_BUCKETS, false),
        }
    }
}

impl L4PortBitmap {
    pub fn bucket(port: u16) -> usize {
        port as usize / PORTS_PER_BUCKET
    }

    pub fn add_port(&mut self, protocol: u8, sport: u16, dport: u16) {
        let (s, d) = match protocol {
            IPPROTO_TCP => (&mut self.tcp_sport, &mut self.tcp_dport),
            IPPROTO_UDP => (&mut self.udp_sport, &mut self.udp_dport),
            _ => return,
        };
        for (bitmap, port) in [(s, sport), (d, dport)] {
            if let Err(e) = bitmap.set(Self::bucket(port), true) {
                debug!("port {} not recorded: {:?}", port, e);
            }
        }
    }

    pub fn reset(&mut self) {
        self.tcp_sport.clear();
        self.tcp_dport.clear();
        self.udp_sport.clear();
        self.udp_dport.clear();
    }
}

/// Port bitmaps of the vRouter, of every VN with flows and of every VM
/// the flows are attributed to.
#[derive(Debug, Default)]
pub struct PortBitmaps {
    vrouter: L4PortBitmap,
    vns: HashMap<String, L4PortBitmap>,
    vms: HashMap<String, L4PortBitmap>,
}

impl PortBitmaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_flow(&mut self, key: &FlowKey, info: &FlowExportInfo) {
        let (protocol, sport, dport) = (key.protocol, key.src_port, key.dst_port);
        self.vrouter.add_port(protocol, sport, dport);
        for vn in [&info.source_vn, &info.dest_vn] {
            self.vns
                .entry(vn_or_unknown(vn).to_owned())
                .or_default()
                .add_port(protocol, sport, dport);
        }
        if !info.vm_name.is_empty() {
            self.vms
                .entry(info.vm_name.clone())
                .or_default()
                .add_port(protocol, sport, dport);
        }
    }

    pub fn vrouter(&self) -> &L4PortBitmap {
        &self.vrouter
    }

    pub fn vn(&self, vn: &str) -> Option<&L4PortBitmap> {
        self.vns.get(vn)
    }

    pub fn vm(&self, vm_name: &str) -> Option<&L4PortBitmap> {
        self.vms.get(vm_name)
    }
}
