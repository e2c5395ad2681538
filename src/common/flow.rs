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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use bitflags::bitflags;
use serde::Serialize;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_SCTP: u8 = 132;

/// Stable identity of a directional flow, independent of the kernel index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FlowKey {
    pub nh: u32,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            nh: 0,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            protocol: 0,
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nh:{} {}:{} > {}:{} proto:{}",
            self.nh, self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.protocol
        )
    }
}

bitflags! {
    #[derive(Default)]
    pub struct FlowFlags: u32 {
        const NONE = 0;
        const LOCAL_FLOW = 1 << 0;
        const INGRESS_DIR = 1 << 1;
        const REVERSE_FLOW = 1 << 2;
        const NAT_FLOW = 1 << 3;
        const SHORT_FLOW = 1 << 4;
    }
}

bitflags! {
    /// Policy verdict of a flow.
    #[derive(Default)]
    pub struct TrafficAction: u32 {
        const ALERT = 1 << 1;
        const DENY = 1 << 2;
        const LOG = 1 << 3;
        const PASS = 1 << 4;
        const REJECT = 1 << 5;
        const MIRROR = 1 << 6;
        const VRF_TRANSLATE = 1 << 7;
        const TRAP = 1 << 28;
        const IMPLICIT_DENY = 1 << 29;
    }
}

impl TrafficAction {
    fn name(self) -> &'static str {
        match self {
            Self::ALERT => "alert",
            Self::DENY => "deny",
            Self::LOG => "log",
            Self::PASS => "pass",
            Self::REJECT => "reject",
            Self::MIRROR => "mirror",
            Self::VRF_TRANSLATE => "vrf-translate",
            Self::TRAP => "trap",
            Self::IMPLICIT_DENY => "implicit-deny",
            _ => "unknown",
        }
    }
}

// rendered as "pass|log"
impl fmt::Display for TrafficAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for bit in 0..u32::BITS {
            let Some(action) = Self::from_bits(self.bits() & (1 << bit)) else {
                continue;
            };
            if action.is_empty() {
                continue;
            }
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", action.name())?;
            first = false;
        }
        Ok(())
    }
}

/// Reason a flow was never forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Unknown,
    ShortUnavailableInterface,
    ShortIpv4FwdDisabled,
    ShortUnavailableVrf,
    ShortNoSrcRoute,
    ShortNoDstRoute,
    ShortAuditEntry,
    ShortVrfChange,
    ShortNoReverseFlow,
    ShortReverseFlowChange,
    ShortNatChange,
    ShortFlowLimit,
    ShortLinklocalSrcNat,
    ShortFailedVrouterInstall,
    ShortInvalidL2Flow,
    Policy,
    OutPolicy,
    Sg,
    OutSg,
    ReverseSg,
    ReverseOutSg,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Unknown => "UNKNOWN",
            DropReason::ShortUnavailableInterface => "Short flow Interface unavailable",
            DropReason::ShortIpv4FwdDisabled => "Short flow Ipv4 forwarding disabled",
            DropReason::ShortUnavailableVrf => "Short flow VRF unavailable",
            DropReason::ShortNoSrcRoute => "Short flow No Source route",
            DropReason::ShortNoDstRoute => "Short flow No Destination route",
            DropReason::ShortAuditEntry => "Short flow Audit Entry",
            DropReason::ShortVrfChange => "Short flow VRF CHANGE",
            DropReason::ShortNoReverseFlow => "Short flow No Reverse flow",
            DropReason::ShortReverseFlowChange => "Short flow Reverse flow change",
            DropReason::ShortNatChange => "Short flow NAT Changed",
            DropReason::ShortFlowLimit => "Short flow Flow Limit Reached",
            DropReason::ShortLinklocalSrcNat => "Short flow Linklocal source NAT failed",
            DropReason::ShortFailedVrouterInstall => "Short flow vrouter install failed",
            DropReason::ShortInvalidL2Flow => "Short flow invalid L2 flow",
            DropReason::Policy => "Flow drop Policy",
            DropReason::OutPolicy => "Flow drop Out Policy",
            DropReason::Sg => "Flow drop SG",
            DropReason::OutSg => "Flow drop OUT SG",
            DropReason::ReverseSg => "Flow drop REVERSE SG",
            DropReason::ReverseOutSg => "Flow drop REVERSE OUT SG",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelType {
    #[default]
    None,
    MplsGre,
    MplsUdp,
    Vxlan,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::None => write!(f, "NONE"),
            TunnelType::MplsGre => write!(f, "MPLSoGRE"),
            TunnelType::MplsUdp => write!(f, "MPLSoUDP"),
            TunnelType::Vxlan => write!(f, "VXLAN"),
        }
    }
}

bitflags! {
    /// TCP session state tracked by the forwarding plane per flow entry.
    #[derive(Default)]
    pub struct TcpFlowFlags: u16 {
        const SYN = 0x0001;
        const SYN_R = 0x0002;
        const ESTABLISHED = 0x0004;
        const ESTABLISHED_R = 0x0008;
        const FIN = 0x0010;
        const FIN_R = 0x0020;
        const RST = 0x0040;
        const HALF_CLOSE = 0x0080;
        const DEAD = 0x0100;

        const CLOSED = Self::HALF_CLOSE.bits | Self::RST.bits;
        const SYN_ANY = Self::SYN.bits | Self::SYN_R.bits;
        const ESTABLISHED_ANY = Self::ESTABLISHED.bits | Self::ESTABLISHED_R.bits;
    }
}
