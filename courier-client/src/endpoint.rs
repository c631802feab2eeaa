//! Datacenter endpoints and the built-in address table.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// One backend datacenter address capable of terminating a connection.
///
/// Immutable once resolved; it keys the media-session map and the stored
/// credentials.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// IPv4 or IPv6 address.
    pub addr:      IpAddr,
    /// TCP port.
    pub port:      u16,
    /// Datacenter id (1..=5, or 203 for the CDN-like DC).
    pub dc_id:     i32,
    /// Media-only datacenter.
    pub media:     bool,
    /// Part of the test network.
    pub test_mode: bool,
}

impl Endpoint {
    /// Where to open the TCP connection.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// The `dc` field of `p_q_inner_data_dc`: `+10000` on the test network,
    /// negated for media datacenters.
    pub fn handshake_dc_id(&self) -> i32 {
        let id = if self.test_mode { self.dc_id + 10_000 } else { self.dc_id };
        if self.media { -id } else { id }
    }

    /// Same datacenter, ignoring address and port.
    pub fn same_dc(&self, other: &Endpoint) -> bool {
        self.dc_id == other.dc_id && self.media == other.media && self.test_mode == other.test_mode
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DC{}", self.dc_id)?;
        if self.media {
            f.write_str("-media")?;
        }
        if self.test_mode {
            f.write_str("-test")?;
        }
        write!(f, " ({})", self.socket_addr())
    }
}

// ─── Address table ────────────────────────────────────────────────────────────

const PROD: &[(i32, &str)] = &[
    (1, "149.154.175.53"),
    (2, "149.154.167.51"),
    (3, "149.154.175.100"),
    (4, "149.154.167.91"),
    (5, "91.108.56.130"),
    (203, "91.105.192.100"),
];

const PROD_MEDIA: &[(i32, &str)] = &[
    (2, "149.154.167.151"),
    (4, "149.154.164.250"),
];

const PROD_IPV6: &[(i32, &str)] = &[
    (1, "2001:b28:f23d:f001::a"),
    (2, "2001:67c:4e8:f002::a"),
    (3, "2001:b28:f23d:f003::a"),
    (4, "2001:67c:4e8:f004::a"),
    (5, "2001:b28:f23f:f005::a"),
    (203, "2a0a:f280:203:a:5000::100"),
];

const PROD_IPV6_MEDIA: &[(i32, &str)] = &[
    (2, "2001:67c:4e8:f002::b"),
    (4, "2001:67c:4e8:f004::b"),
];

const TEST: &[(i32, &str)] = &[
    (1, "149.154.175.10"),
    (2, "149.154.167.40"),
    (3, "149.154.175.117"),
];

const TEST_IPV6: &[(i32, &str)] = &[
    (1, "2001:b28:f23d:f001::e"),
    (2, "2001:67c:4e8:f002::e"),
    (3, "2001:b28:f23d:f003::e"),
];

fn lookup(table: &[(i32, &str)], dc_id: i32) -> Option<IpAddr> {
    table.iter().find(|(id, _)| *id == dc_id).and_then(|(_, ip)| ip.parse().ok())
}

/// Resolves datacenter ids to [`Endpoint`]s honoring network preferences.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DcTable {
    /// Use the test network (port 80, test addresses).
    pub test_mode: bool,
    /// Prefer IPv6 addresses.
    pub ipv6:      bool,
    /// Use port 5222 instead of 443.
    pub alt_port:  bool,
}

impl DcTable {
    /// The endpoint for `dc_id`, or `None` if the table has no such DC.
    ///
    /// Media DCs without a dedicated address fall back to the regular one.
    /// The test network has no media addresses.
    pub fn resolve(&self, dc_id: i32, media: bool) -> Option<Endpoint> {
        let addr = if self.test_mode {
            lookup(if self.ipv6 { TEST_IPV6 } else { TEST }, dc_id)?
        } else {
            let (regular, dedicated) =
                if self.ipv6 { (PROD_IPV6, PROD_IPV6_MEDIA) } else { (PROD, PROD_MEDIA) };
            let dedicated = if media { lookup(dedicated, dc_id) } else { None };
            match dedicated {
                Some(addr) => addr,
                None       => lookup(regular, dc_id)?,
            }
        };

        let port = if self.test_mode {
            80
        } else if self.alt_port {
            5222
        } else {
            443
        };

        Some(Endpoint { addr, port, dc_id, media, test_mode: self.test_mode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_defaults() {
        let ep = DcTable::default().resolve(2, false).unwrap();
        assert_eq!(ep.socket_addr(), "149.154.167.51:443".parse().unwrap());
        assert_eq!(ep.handshake_dc_id(), 2);
        assert_eq!(ep.to_string(), "DC2 (149.154.167.51:443)");
    }

    #[test]
    fn media_uses_dedicated_address_when_known() {
        let table = DcTable::default();
        assert_eq!(table.resolve(4, true).unwrap().addr.to_string(), "149.154.164.250");
        // DC1 has no media address
        let ep = table.resolve(1, true).unwrap();
        assert_eq!(ep.addr.to_string(), "149.154.175.53");
        assert_eq!(ep.handshake_dc_id(), -1);
    }

    #[test]
    fn preferences_change_address_and_port() {
        let alt = DcTable { alt_port: true, ..Default::default() };
        assert_eq!(alt.resolve(3, false).unwrap().port, 5222);

        let v6 = DcTable { ipv6: true, ..Default::default() };
        assert!(v6.resolve(5, false).unwrap().addr.is_ipv6());

        let test = DcTable { test_mode: true, alt_port: true, ..Default::default() };
        let ep = test.resolve(2, false).unwrap();
        assert_eq!(ep.socket_addr(), "149.154.167.40:80".parse().unwrap());
        assert_eq!(ep.handshake_dc_id(), 10_002);
    }

    #[test]
    fn unknown_dc_has_no_endpoint() {
        assert!(DcTable::default().resolve(9, false).is_none());
        assert!(DcTable { test_mode: true, ..Default::default() }.resolve(4, false).is_none());
    }

    #[test]
    fn endpoints_differ_by_media_flag() {
        let t = DcTable::default();
        assert_ne!(t.resolve(1, true), t.resolve(1, false));
        assert!(!t.resolve(1, true).unwrap().same_dc(&t.resolve(1, false).unwrap()));
    }
}
