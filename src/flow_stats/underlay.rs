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

use serde::Serialize;

use super::export::RevFlowParams;
use super::flow_export_info::FlowExportInfo;
use crate::common::TunnelType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnderlayMeta {
    pub vrouter_ip: IpAddr,
    pub other_vrouter_ip: String,
    pub source_port: u16,
    pub tunnel_type: TunnelType,
}

/// Fills tunnel metadata of exported records.
pub struct UnderlayResolver {
    router_id: IpAddr,
}

impl UnderlayResolver {
    pub fn new(router_id: IpAddr) -> Self {
        Self { router_id }
    }

    pub fn set_router_id(&mut self, router_id: IpAddr) {
        self.router_id = router_id;
    }

    /// Resolves underlay metadata for a record of `info`.
    ///
    /// The source port of a tunneled flow is taken from the kernel once and
    /// cached in `info`. Local flows never leave the host and carry no port.
    pub fn resolve_underlay(
        &self,
        info: &mut FlowExportInfo,
        rev: Option<&RevFlowParams>,
        kernel_sport: Option<u16>,
    ) -> UnderlayMeta {
        if info.is_local() {
            return UnderlayMeta {
                vrouter_ip: self.router_id,
                other_vrouter_ip: self.router_id.to_string(),
                source_port: 0,
                tunnel_type: TunnelType::None,
            };
        }

        let other_vrouter_ip = if !info.peer_vrouter.is_empty() {
            info.peer_vrouter.clone()
        } else {
            rev.map(|r| r.peer_vrouter.clone()).unwrap_or_default()
        };

        let source_port = match info.tunnel_type {
            TunnelType::None => 0,
            // no udp header to hash into
            TunnelType::MplsGre => {
                if info.exported {
                    info.underlay_sport_exported = true;
                }
                0
            }
            _ if info.underlay_sport_exported => info.underlay_source_port,
            _ => {
                if let Some(port) = kernel_sport.filter(|p| *p != 0) {
                    info.underlay_source_port = port;
                }
                if info.underlay_source_port != 0 && info.exported {
                    info.underlay_sport_exported = true;
                }
                info.underlay_source_port
            }
        };

        UnderlayMeta {
            vrouter_ip: self.router_id,
            other_vrouter_ip,
            source_port,
            tunnel_type: info.tunnel_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FlowFlags, FlowKey, Timestamp};
    use crate::flow_stats::FlowMetadata;

    fn resolver() -> UnderlayResolver {
        UnderlayResolver::new("10.0.0.1".parse().unwrap())
    }

    fn info(tunnel_type: TunnelType, flags: FlowFlags) -> FlowExportInfo {
        let mut info = FlowExportInfo::new(
            FlowMetadata {
                tunnel_type,
                flags,
                peer_vrouter: "10.0.0.2".to_owned(),
                ..Default::default()
            },
            Timestamp::ZERO,
        );
        info.exported = true;
        info
    }

    #[test]
    fn local_flow_has_no_port() {
        let mut i = info(TunnelType::MplsUdp, FlowFlags::LOCAL_FLOW);
        let meta = resolver().resolve_underlay(&mut i, None, Some(5000));
        assert_eq!(meta.source_port, 0);
        assert_eq!(meta.other_vrouter_ip, "10.0.0.1");
        assert!(!i.underlay_sport_exported);
    }

    #[test]
    fn port_taken_once() {
        let r = resolver();
        let mut i = info(TunnelType::MplsUdp, FlowFlags::empty());
        let meta = r.resolve_underlay(&mut i, None, Some(5000));
        assert_eq!(meta.source_port, 5000);
        assert_eq!(meta.other_vrouter_ip, "10.0.0.2");
        assert!(i.underlay_sport_exported);

        let meta = r.resolve_underlay(&mut i, None, Some(6000));
        assert_eq!(meta.source_port, 5000);
    }

    #[test]
    fn gre_sets_flag_without_port() {
        let mut i = info(TunnelType::MplsGre, FlowFlags::empty());
        let meta = resolver().resolve_underlay(&mut i, None, Some(5000));
        assert_eq!(meta.source_port, 0);
        assert!(i.underlay_sport_exported);
    }

    #[test]
    fn untunneled_flow_has_no_port() {
        let mut i = info(TunnelType::None, FlowFlags::empty());
        let meta = resolver().resolve_underlay(&mut i, None, Some(5000));
        assert_eq!(meta.source_port, 0);
        assert_eq!(meta.other_vrouter_ip, "10.0.0.2");
        assert_eq!(i.underlay_source_port, 0);
        assert!(!i.underlay_sport_exported);
    }

    #[test]
    fn flag_waits_for_export() {
        let mut i = info(TunnelType::Vxlan, FlowFlags::empty());
        i.exported = false;
        resolver().resolve_underlay(&mut i, None, Some(5000));
        assert!(!i.underlay_sport_exported);
        assert_eq!(i.underlay_source_port, 5000);
    }

    #[test]
    fn peer_from_reverse_flow() {
        let mut i = info(TunnelType::Vxlan, FlowFlags::empty());
        i.peer_vrouter.clear();
        let rev = RevFlowParams {
            key: FlowKey::default(),
            flow_uuid: Default::default(),
            peer_vrouter: "10.0.0.3".to_owned(),
            exported: true,
        };
        let meta = resolver().resolve_underlay(&mut i, Some(&rev), None);
        assert_eq!(meta.other_vrouter_ip, "10.0.0.3");
        assert_eq!(meta.source_port, 0);
        assert!(!i.underlay_sport_exported);
    }
}
