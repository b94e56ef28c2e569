//! Address-to-Tap selection across joined networks.

use crate::tap::TapShared;
use std::net::IpAddr;
use std::sync::Arc;
use tapsock_core::AddressFamily;

/// Tap that should carry traffic for `dest`.
///
/// Prefers a Tap with an address of the same family that equals `dest` or
/// whose subnet contains it. Otherwise the first Tap, in list order, with a
/// managed route covering `dest`. Route matching is first-match, not
/// longest-prefix.
pub fn select_tap(taps: &[Arc<TapShared>], dest: &IpAddr) -> Option<Arc<TapShared>> {
    let by_address = taps.iter().find(|tap| {
        tap.addresses()
            .iter()
            .any(|cidr| cidr.addr() == *dest || cidr.contains(dest))
    });
    if let Some(tap) = by_address {
        return Some(Arc::clone(tap));
    }

    taps.iter()
        .find(|tap| tap.routes().iter().any(|route| route.target.contains(dest)))
        .map(Arc::clone)
}

/// Tap owning the local address `addr`.
///
/// An unspecified address selects the first Tap carrying any address of
/// `family`.
pub fn select_bind_tap(
    taps: &[Arc<TapShared>],
    family: AddressFamily,
    addr: &IpAddr,
) -> Option<Arc<TapShared>> {
    if addr.is_unspecified() {
        return taps
            .iter()
            .find(|tap| tap.first_address(family).is_some())
            .map(Arc::clone);
    }
    taps.iter()
        .find(|tap| tap.addresses().iter().any(|cidr| cidr.addr() == *addr))
        .map(Arc::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MacAddress, NullSink};
    use crate::tap::{Tap, TapConfig};
    use tapsock_core::{NetworkId, NoopNotifier, SocketAccounting, StackConfig};

    fn start(network: u64, addresses: &[&str], routes: &[&str]) -> Tap {
        let mut config = TapConfig::new(NetworkId(network), MacAddress([0x02, 0, 0, 0, 0, network as u8]));
        for a in addresses {
            config = config.with_address(a.parse().unwrap());
        }
        for r in routes {
            config = config.with_route(r.parse().unwrap());
        }
        Tap::start(
            config,
            StackConfig::default(),
            Arc::new(NullSink),
            Arc::new(NoopNotifier),
            Arc::new(SocketAccounting::new(8)),
        )
        .unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_select_by_subnet() {
        let a = start(1, &["10.1.0.1/16"], &[]);
        let b = start(2, &["10.2.0.1/16", "fd00::1/64"], &[]);
        let taps = vec![Arc::clone(a.shared()), Arc::clone(b.shared())];

        assert_eq!(select_tap(&taps, &ip("10.1.3.4")).unwrap().network(), NetworkId(1));
        assert_eq!(select_tap(&taps, &ip("10.2.0.1")).unwrap().network(), NetworkId(2));
        assert_eq!(select_tap(&taps, &ip("fd00::99")).unwrap().network(), NetworkId(2));
        assert!(select_tap(&taps, &ip("192.168.1.1")).is_none());
    }

    #[test]
    fn test_select_falls_back_to_routes_in_order() {
        let a = start(3, &["10.1.0.1/16"], &["172.16.0.0/12 via 10.1.0.254"]);
        let b = start(4, &["10.2.0.1/16"], &["172.16.5.0/24 via 10.2.0.254"]);
        let taps = vec![Arc::clone(a.shared()), Arc::clone(b.shared())];

        // The broader route on the first Tap wins over the more specific one
        assert_eq!(select_tap(&taps, &ip("172.16.5.9")).unwrap().network(), NetworkId(3));
    }

    #[test]
    fn test_select_bind_tap() {
        let a = start(5, &["10.1.0.1/16"], &[]);
        let b = start(6, &["10.2.0.1/16", "fd00::1/64"], &[]);
        let taps = vec![Arc::clone(a.shared()), Arc::clone(b.shared())];

        let any4 = ip("0.0.0.0");
        let any6 = ip("::");
        assert_eq!(
            select_bind_tap(&taps, AddressFamily::Inet, &any4).unwrap().network(),
            NetworkId(5)
        );
        assert_eq!(
            select_bind_tap(&taps, AddressFamily::Inet6, &any6).unwrap().network(),
            NetworkId(6)
        );
        assert_eq!(
            select_bind_tap(&taps, AddressFamily::Inet, &ip("10.2.0.1")).unwrap().network(),
            NetworkId(6)
        );
        assert!(select_bind_tap(&taps, AddressFamily::Inet, &ip("10.2.0.2")).is_none());
    }
}
