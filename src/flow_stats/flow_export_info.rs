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

use std::net::IpAddr;

use uuid::Uuid;

use crate::common::{
    DropReason, FlowFlags, FlowKey, TcpFlowFlags, Timestamp, TrafficAction, TunnelType,
};

/// Flow attributes supplied by the flow table when a flow is added.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowMetadata {
    pub flow_uuid: Uuid,
    pub egress_uuid: Uuid,
    pub flow_handle: u32,
    pub source_vn: String,
    pub dest_vn: String,
    pub sg_rule_uuid: String,
    pub nw_ace_uuid: String,
    pub vmi_uuid: String,
    pub vm_name: String,
    // floating ip the flow is translated to, and the interface owning it
    pub fip: Option<IpAddr>,
    pub fip_vmi: Uuid,
    pub tunnel_type: TunnelType,
    pub peer_vrouter: String,
    pub action: TrafficAction,
    pub drop_reason: Option<DropReason>,
    pub flags: FlowFlags,
    pub rev_flow_key: Option<FlowKey>,
}

/// Aging progress of a flow.
///
/// `Aged` is only entered from `Candidate`, `Removed` only from `Aged`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgingState {
    Active,
    // zero delta observed since `since`
    Candidate { since: Timestamp },
    // eviction requested from the flow table
    Aged { at: Timestamp },
    Removed,
}

impl Default for AgingState {
    fn default() -> Self {
        AgingState::Active
    }
}

/// Kernel reading the next delta is computed against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelCounters {
    pub bytes: u64,
    pub packets: u64,
}

/// Per flow soft state owned by the collector.
#[derive(Clone, Debug)]
pub struct FlowExportInfo {
    pub setup_time: Timestamp,
    pub teardown_time: Option<Timestamp>,
    pub last_modified_time: Timestamp,
    pub bytes: u64,
    pub packets: u64,
    pub flow_handle: u32,

    pub flow_uuid: Uuid,
    pub egress_uuid: Uuid,
    pub source_vn: String,
    pub dest_vn: String,
    pub sg_rule_uuid: String,
    pub nw_ace_uuid: String,
    pub vmi_uuid: String,
    pub vm_name: String,
    pub fip: Option<IpAddr>,
    pub fip_vmi: Uuid,
    pub action: TrafficAction,
    pub drop_reason: Option<DropReason>,
    pub flags: FlowFlags,
    pub rev_flow_key: Option<FlowKey>,

    pub tunnel_type: TunnelType,
    pub peer_vrouter: String,
    pub underlay_source_port: u16,
    pub underlay_sport_exported: bool,
    pub exported: bool,
    pub tcp_flags: TcpFlowFlags,

    pub aging_state: AgingState,

    pub(crate) last_kernel: Option<KernelCounters>,
    pub(crate) last_kernel_time: Option<Timestamp>,
    pub(crate) anomaly_streak: u8,
    pub(crate) evict_requested_at: Option<Timestamp>,
}

impl FlowExportInfo {
    pub fn new(metadata: FlowMetadata, setup_time: Timestamp) -> Self {
        let mut info = Self {
            setup_time,
            teardown_time: None,
            last_modified_time: setup_time,
            bytes: 0,
            packets: 0,
            flow_handle: 0,
            flow_uuid: Uuid::nil(),
            egress_uuid: Uuid::nil(),
            source_vn: String::new(),
            dest_vn: String::new(),
            sg_rule_uuid: String::new(),
            nw_ace_uuid: String::new(),
            vmi_uuid: String::new(),
            vm_name: String::new(),
            fip: None,
            fip_vmi: Uuid::nil(),
            action: TrafficAction::empty(),
            drop_reason: None,
            flags: FlowFlags::empty(),
            rev_flow_key: None,
            tunnel_type: TunnelType::None,
            peer_vrouter: String::new(),
            underlay_source_port: 0,
            underlay_sport_exported: false,
            exported: false,
            tcp_flags: TcpFlowFlags::empty(),
            aging_state: AgingState::Active,
            last_kernel: None,
            last_kernel_time: None,
            anomaly_streak: 0,
            evict_requested_at: None,
        };
        info.apply_metadata(metadata);
        info
    }

    /// Replaces flow attributes after the flow was re-evaluated.
    ///
    /// Counters and export state carry over. A new kernel handle restarts
    /// delta computation from the new entry.
    pub fn apply_metadata(&mut self, metadata: FlowMetadata) {
        if metadata.flow_handle != self.flow_handle {
            self.set_flow_handle(metadata.flow_handle);
        }
        self.flow_uuid = metadata.flow_uuid;
        self.egress_uuid = metadata.egress_uuid;
        self.source_vn = metadata.source_vn;
        self.dest_vn = metadata.dest_vn;
        self.sg_rule_uuid = metadata.sg_rule_uuid;
        self.nw_ace_uuid = metadata.nw_ace_uuid;
        self.vmi_uuid = metadata.vmi_uuid;
        self.vm_name = metadata.vm_name;
        self.fip = metadata.fip;
        self.fip_vmi = metadata.fip_vmi;
        self.tunnel_type = metadata.tunnel_type;
        self.peer_vrouter = metadata.peer_vrouter;
        self.action = metadata.action;
        self.drop_reason = metadata.drop_reason;
        self.flags = metadata.flags;
        self.rev_flow_key = metadata.rev_flow_key;
    }

    pub fn set_flow_handle(&mut self, flow_handle: u32) {
        self.flow_handle = flow_handle;
        self.last_kernel = None;
        self.last_kernel_time = None;
        self.anomaly_streak = 0;
    }

    /// Sets the teardown time, keeping the first one.
    pub fn set_teardown_time(&mut self, time: Timestamp) {
        if self.teardown_time.is_none() {
            self.teardown_time = Some(time.max(self.setup_time));
        }
    }

    pub fn is_flags_set(&self, flags: FlowFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(FlowFlags::LOCAL_FLOW)
    }

    pub fn is_ingress(&self) -> bool {
        self.flags.contains(FlowFlags::INGRESS_DIR)
    }

    pub fn is_action_log(&self) -> bool {
        self.action.contains(TrafficAction::LOG)
    }

    pub fn is_reverse(&self) -> bool {
        self.flags.contains(FlowFlags::REVERSE_FLOW)
    }

    /// Floating ip and owning interface, when the flow is translated.
    pub fn floating_ip(&self) -> Option<(IpAddr, Uuid)> {
        self.fip.filter(|_| !self.fip_vmi.is_nil()).map(|ip| (ip, self.fip_vmi))
    }

    pub fn is_aged(&self) -> bool {
        matches!(self.aging_state, AgingState::Aged { .. })
    }

    pub fn last_kernel_reading(&self) -> Option<KernelCounters> {
        self.last_kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(handle: u32) -> FlowMetadata {
        FlowMetadata {
            flow_handle: handle,
            source_vn: "vn1".to_owned(),
            dest_vn: "vn2".to_owned(),
            flags: FlowFlags::INGRESS_DIR,
            ..Default::default()
        }
    }

    #[test]
    fn teardown_set_once() {
        let mut info = FlowExportInfo::new(metadata(1), Timestamp::from_secs(10));
        info.set_teardown_time(Timestamp::from_secs(20));
        info.set_teardown_time(Timestamp::from_secs(30));
        assert_eq!(info.teardown_time, Some(Timestamp::from_secs(20)));

        let mut info = FlowExportInfo::new(metadata(1), Timestamp::from_secs(10));
        info.set_teardown_time(Timestamp::from_secs(5));
        assert_eq!(info.teardown_time, Some(Timestamp::from_secs(10)));
    }

    #[test]
    fn metadata_replace_keeps_counters() {
        let mut info = FlowExportInfo::new(metadata(1), Timestamp::from_secs(10));
        info.bytes = 100;
        info.exported = true;
        info.last_kernel = Some(KernelCounters {
            bytes: 100,
            packets: 1,
        });

        info.apply_metadata(metadata(1));
        assert_eq!(info.bytes, 100);
        assert!(info.exported);
        assert!(info.last_kernel.is_some());

        info.apply_metadata(metadata(2));
        assert_eq!(info.flow_handle, 2);
        assert_eq!(info.bytes, 100);
        assert!(info.last_kernel.is_none());
        assert!(info.is_ingress());
    }
}
