use std::{cmp, fmt, net::IpAddr};

use log::debug;

use super::message::{IPProtocolType, TrafficSelector};

/// One SPD entry: traffic between `local` and `remote` may be protected by a Child SA.
#[derive(Clone, Debug)]
pub struct SpdEntry {
    pub local: TrafficSelector,
    pub remote: TrafficSelector,
}

impl fmt::Display for SpdEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// Security Policy Database; read-only once the engine starts.
#[derive(Clone, Debug)]
pub struct Spd {
    entries: Vec<SpdEntry>,
}

/// Traffic selectors agreed for a Child SA, from the initiator's and responder's sides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NarrowedSelectors {
    pub ts_initiator: Vec<TrafficSelector>,
    pub ts_responder: Vec<TrafficSelector>,
}

impl Spd {
    pub fn new(entries: Vec<SpdEntry>) -> Spd {
        Spd { entries }
    }

    pub fn allow_any() -> Spd {
        Spd {
            entries: vec![SpdEntry {
                local: TrafficSelector::any_ipv4(),
                remote: TrafficSelector::any_ipv4(),
            }],
        }
    }

    pub fn entries(&self) -> &[SpdEntry] {
        &self.entries
    }

    /// Selectors an initiator proposes: (TSi, TSr) = (local, remote).
    pub fn initiator_selectors(&self) -> (Vec<TrafficSelector>, Vec<TrafficSelector>) {
        let local = self.entries.iter().map(|entry| entry.local.clone()).collect();
        let remote = self.entries.iter().map(|entry| entry.remote.clone()).collect();
        (local, remote)
    }

    /// Responder side: narrows the initiator's proposal to the first SPD entry it overlaps.
    pub fn narrow(
        &self,
        ts_initiator: &[TrafficSelector],
        ts_responder: &[TrafficSelector],
    ) -> Option<NarrowedSelectors> {
        self.entries.iter().find_map(|entry| {
            let narrowed_initiator = ts_initiator
                .iter()
                .filter_map(|ts| intersect(ts, &entry.remote))
                .collect::<Vec<_>>();
            let narrowed_responder = ts_responder
                .iter()
                .filter_map(|ts| intersect(ts, &entry.local))
                .collect::<Vec<_>>();
            if narrowed_initiator.is_empty() || narrowed_responder.is_empty() {
                None
            } else {
                debug!("Traffic selectors matched SPD entry {}", entry);
                Some(NarrowedSelectors {
                    ts_initiator: narrowed_initiator,
                    ts_responder: narrowed_responder,
                })
            }
        })
    }
}

fn intersect_protocol(a: IPProtocolType, b: IPProtocolType) -> Option<IPProtocolType> {
    if a == IPProtocolType::ANY {
        Some(b)
    } else if b == IPProtocolType::ANY || a == b {
        Some(a)
    } else {
        None
    }
}

/// Intersection of two selectors; protocol 0 matches any protocol.
pub fn intersect(a: &TrafficSelector, b: &TrafficSelector) -> Option<TrafficSelector> {
    if a.ts_type() != b.ts_type() {
        return None;
    }
    let ip_protocol = intersect_protocol(a.ip_protocol(), b.ip_protocol())?;
    let start_port = cmp::max(*a.port_range().start(), *b.port_range().start());
    let end_port = cmp::min(*a.port_range().end(), *b.port_range().end());
    if start_port > end_port {
        return None;
    }
    let start_addr: IpAddr = cmp::max(*a.addr_range().start(), *b.addr_range().start());
    let end_addr: IpAddr = cmp::min(*a.addr_range().end(), *b.addr_range().end());
    if start_addr > end_addr {
        return None;
    }
    TrafficSelector::new(ip_protocol, start_addr..=end_addr, start_port..=end_port).ok()
}

/// Checks that `inner` selects no traffic outside of `outer`.
pub fn contains(outer: &TrafficSelector, inner: &TrafficSelector) -> bool {
    match intersect(outer, inner) {
        Some(intersection) => &intersection == inner,
        None => false,
    }
}

/// Initiator side: every selector the responder returned must be within what was proposed.
pub fn selectors_within(
    proposed: &[TrafficSelector],
    negotiated: &[TrafficSelector],
) -> bool {
    !negotiated.is_empty()
        && negotiated
            .iter()
            .all(|ts| proposed.iter().any(|proposed| contains(proposed, ts)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ts(protocol: IPProtocolType, start: [u8; 4], end: [u8; 4], ports: (u16, u16)) -> TrafficSelector {
        TrafficSelector::new(
            protocol,
            IpAddr::V4(Ipv4Addr::from(start))..=IpAddr::V4(Ipv4Addr::from(end)),
            ports.0..=ports.1,
        )
        .unwrap()
    }

    #[test]
    fn wildcard_protocol_and_ports() {
        let any = TrafficSelector::any_ipv4();
        let tcp = ts(IPProtocolType::TCP, [10, 0, 0, 1], [10, 0, 0, 1], (443, 443));
        assert_eq!(intersect(&any, &tcp), Some(tcp.clone()));
        assert_eq!(intersect(&tcp, &any), Some(tcp.clone()));
        assert!(contains(&any, &tcp));
        assert!(!contains(&tcp, &any));
    }

    #[test]
    fn protocol_mismatch() {
        let tcp = ts(IPProtocolType::TCP, [10, 0, 0, 0], [10, 0, 0, 255], (0, 65535));
        let udp = ts(IPProtocolType::UDP, [10, 0, 0, 0], [10, 0, 0, 255], (0, 65535));
        assert_eq!(intersect(&tcp, &udp), None);
    }

    #[test]
    fn address_and_port_narrowing() {
        let a = ts(IPProtocolType::ANY, [10, 0, 0, 0], [10, 0, 0, 255], (1000, 2000));
        let b = ts(IPProtocolType::UDP, [10, 0, 0, 128], [10, 0, 1, 0], (1500, 3000));
        let expected = ts(IPProtocolType::UDP, [10, 0, 0, 128], [10, 0, 0, 255], (1500, 2000));
        assert_eq!(intersect(&a, &b), Some(expected));

        let disjoint = ts(IPProtocolType::ANY, [192, 168, 0, 0], [192, 168, 0, 255], (0, 65535));
        assert_eq!(intersect(&a, &disjoint), None);
    }

    #[test]
    fn address_family_mismatch() {
        let v6 = TrafficSelector::new(
            IPProtocolType::ANY,
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)..=IpAddr::V6(Ipv6Addr::LOCALHOST),
            0..=65535,
        )
        .unwrap();
        assert_eq!(intersect(&TrafficSelector::any_ipv4(), &v6), None);
    }

    #[test]
    fn spd_narrowing() {
        let spd = Spd::new(vec![
            SpdEntry {
                local: ts(IPProtocolType::ANY, [10, 1, 0, 0], [10, 1, 255, 255], (0, 65535)),
                remote: ts(IPProtocolType::ANY, [192, 168, 1, 0], [192, 168, 1, 255], (0, 65535)),
            },
            SpdEntry {
                local: ts(IPProtocolType::TCP, [10, 2, 0, 1], [10, 2, 0, 1], (22, 22)),
                remote: TrafficSelector::any_ipv4(),
            },
        ]);
        let ts_i = vec![ts(IPProtocolType::ANY, [172, 16, 0, 5], [172, 16, 0, 5], (0, 65535))];
        let ts_r = vec![TrafficSelector::any_ipv4()];
        let narrowed = spd.narrow(&ts_i, &ts_r).unwrap();
        assert_eq!(narrowed.ts_initiator, ts_i);
        assert_eq!(
            narrowed.ts_responder,
            vec![ts(IPProtocolType::TCP, [10, 2, 0, 1], [10, 2, 0, 1], (22, 22))]
        );
        assert!(selectors_within(&ts_r, &narrowed.ts_responder));

        let ts_r = vec![ts(IPProtocolType::ANY, [8, 8, 8, 8], [8, 8, 8, 8], (0, 65535))];
        assert!(spd.narrow(&ts_i, &ts_r).is_none());
    }

    #[test]
    fn negotiated_selectors_must_be_within_proposal() {
        let proposed = vec![ts(IPProtocolType::ANY, [10, 0, 0, 0], [10, 0, 0, 255], (0, 65535))];
        let wider = vec![TrafficSelector::any_ipv4()];
        assert!(!selectors_within(&proposed, &wider));
        assert!(!selectors_within(&proposed, &[]));
        assert!(selectors_within(&proposed, &proposed));
    }
}
