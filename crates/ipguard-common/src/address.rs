//! Address normalization
//!
//! Every address that enters the rule engine, whether from a stored rule or
//! from a connection attempt, is turned into a [`HostAddress`]: a masked
//! network (a single host is a full-length prefix) plus an optional port.
//! Two textual spellings of the same address normalize to equal values, so
//! a `HostAddress` can be used directly as part of a hash key.
//!
//! Subnet math is delegated to `ipnetwork`; nothing outside this module
//! touches that crate.

use crate::error::AddressError;
use ipnetwork::IpNetwork;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Port value persisted for "any port"
pub const UNSPECIFIED_PORT: u16 = 0;

/// Maps the persisted "any port" sentinel to `None`
#[inline]
pub fn normalize_port(port: Option<u16>) -> Option<u16> {
    port.filter(|p| *p != UNSPECIFIED_PORT)
}

/// Normalized host or network address with an optional port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAddress {
    network: IpNetwork,
    port: Option<u16>,
}

impl Hash for HostAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.ip().hash(state);
        self.network.prefix().hash(state);
        self.port.hash(state);
    }
}

impl HostAddress {
    /// Parse a textual address.
    ///
    /// Accepted forms: `1.2.3.4`, `::1`, `[::1]`, `10.0.0.0/8`, `fd00::/8`,
    /// `1.2.3.4:443` and `[::1]:443`. An explicit `port` argument wins only
    /// if the text carries no port of its own (or the same one).
    /// Host bits of a network are masked off, so `10.1.2.3/8` is `10.0.0.0/8`.
    pub fn parse(text: &str, port: Option<u16>) -> Result<Self, AddressError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }
        let port = normalize_port(port);

        if let Ok(sock) = text.parse::<SocketAddr>() {
            let port = match (normalize_port(Some(sock.port())), port) {
                (Some(inline), Some(explicit)) if inline != explicit => {
                    return Err(AddressError::PortMismatch {
                        address: text.to_string(),
                        inline,
                        explicit,
                    });
                }
                (inline, explicit) => explicit.or(inline),
            };
            return Ok(Self::host(sock.ip(), port));
        }

        let bare = text
            .strip_prefix('[')
            .and_then(|t| t.strip_suffix(']'))
            .unwrap_or(text);

        let (addr_part, prefix_part) = match bare.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (bare, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| AddressError::Invalid(text.to_string()))?;

        let max = max_prefix(&addr);
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| AddressError::InvalidPrefix(text.to_string()))?,
            None => max,
        };

        let network = IpNetwork::new(addr, prefix)
            .and_then(|n| IpNetwork::new(n.network(), prefix))
            .map_err(|_| AddressError::InvalidPrefix(text.to_string()))?;

        Ok(Self { network, port })
    }

    /// Single host address
    pub fn host(ip: IpAddr, port: Option<u16>) -> Self {
        Self {
            network: IpNetwork::from(ip),
            port: normalize_port(port),
        }
    }

    /// Network (or host) address
    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.network.ip()
    }

    /// Network prefix length
    #[inline]
    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    #[inline]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    #[inline]
    pub fn is_ipv6(&self) -> bool {
        self.network.is_ipv6()
    }

    /// True if this is exactly one address
    #[inline]
    pub fn is_host(&self) -> bool {
        self.prefix() == max_prefix(&self.ip())
    }

    /// The literal host `0.0.0.0` or `::`. Networks based at zero such as
    /// `0.0.0.0/8` are plain subnets.
    #[inline]
    pub fn is_any_local(&self) -> bool {
        self.is_host() && self.ip().is_unspecified()
    }

    /// True if the address stands for more than one host.
    ///
    /// The unspecified address counts as a wildcard even at full prefix
    /// length: a rule on `0.0.0.0:443` covers every IPv4 destination on 443.
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        !self.is_host() || self.is_any_local()
    }

    /// Prefix length used to order wildcard matches, most specific first.
    /// The any-local address is the broadest network of its family.
    #[inline]
    pub fn specificity(&self) -> u8 {
        if self.is_any_local() {
            0
        } else {
            self.prefix()
        }
    }

    /// Whether `ip` is covered by this address as a wildcard
    #[inline]
    pub fn covers(&self, ip: IpAddr) -> bool {
        if self.is_any_local() {
            return self.ip().is_ipv4() == ip.is_ipv4();
        }
        self.network.contains(ip)
    }

    pub fn with_port(&self, port: Option<u16>) -> Self {
        Self {
            network: self.network,
            port: normalize_port(port),
        }
    }

    pub fn without_port(&self) -> Self {
        self.with_port(None)
    }

    /// Canonical text of the address part (no port), as persisted in rules
    pub fn to_normalized_string(&self) -> String {
        if self.is_host() {
            self.ip().to_string()
        } else {
            format!("{}/{}", self.ip(), self.prefix())
        }
    }

    /// IPv4 address equivalent to this IPv6 host, if any.
    ///
    /// IPv4-mapped addresses (`::ffff:a.b.c.d`) always translate. With
    /// `auto_translate` set, NAT64 (`64:ff9b::/96`), 6to4 (`2002::/16`) and
    /// IPv4-compatible (`::a.b.c.d`) addresses translate as well.
    pub fn ipv4_equivalent(&self, auto_translate: bool) -> Option<Self> {
        if !self.is_host() {
            return None;
        }
        let IpAddr::V6(v6) = self.ip() else {
            return None;
        };
        let v4 = embedded_ipv4(&v6).or_else(|| {
            if auto_translate {
                translated_ipv4(&v6)
            } else {
                None
            }
        })?;
        Some(Self::host(IpAddr::V4(v4), self.port))
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.is_ipv6()) {
            (None, _) => write!(f, "{}", self.to_normalized_string()),
            (Some(port), true) => write!(f, "[{}]:{}", self.to_normalized_string(), port),
            (Some(port), false) => write!(f, "{}:{}", self.to_normalized_string(), port),
        }
    }
}

#[inline]
fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// `::ffff:a.b.c.d`
pub fn embedded_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    ip.to_ipv4_mapped()
}

/// NAT64 well-known prefix, 6to4 and IPv4-compatible forms
pub fn translated_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    let o = ip.octets();
    let seg = ip.segments();

    // 64:ff9b::/96
    if seg[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        return Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]));
    }
    // 2002:AABB:CCDD::/48
    if seg[0] == 0x2002 {
        return Some(Ipv4Addr::new(o[2], o[3], o[4], o[5]));
    }
    // ::a.b.c.d, excluding :: and ::1
    if seg[..6] == [0; 6] && (seg[6] != 0 || seg[7] > 1) {
        return Some(Ipv4Addr::new(o[12], o[13], o[14], o[15]));
    }
    None
}
