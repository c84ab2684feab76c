//! IP/port admission filters.
//!
//! A filter set is written as a comma-separated list of `ip[:ports]`
//! entries:
//!
//! ```text
//! 10.0.0.0/8:*, 192.168.1.1:80, host:8000-8999/udp, container, [fd00::1]:53/udp
//! ```
//!
//! The ip part is a literal address, a CIDR block, `0.0.0.0` (any IPv4
//! address), or one of the roles `host` and `container`, which match the
//! host side and the container side of a port mapping respectively.  The
//! optional port part is `*`, a single port or an inclusive `min-max` range,
//! optionally followed by `/tcp` or `/udp`.  Without a port part the filter
//! checks the address only.
//!
//! Entries are tried in declaration order and the first match wins.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::error::FilterError;
use crate::types::Protocol;

/// Which addresses a filter admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSelector {
    Network(IpNetwork),
    /// Host side of a port mapping.
    Host,
    /// Container side of a port mapping.
    Container,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange {
        min: 0,
        max: u16::MAX,
    };

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// A single admission rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub ip: IpSelector,
    /// `None` when the filter checks the address only.
    pub ports: Option<PortRange>,
    pub protocol: Protocol,
}

impl Filter {
    /// Whether `(ip, port)` is admitted; `internal` marks a container-side address.
    pub fn matches(&self, ip: IpAddr, port: u16, internal: bool) -> bool {
        let ip_ok = match &self.ip {
            IpSelector::Network(net) => net.contains(ip) || net.contains(ip.to_canonical()),
            IpSelector::Host => !internal,
            IpSelector::Container => internal,
        };
        ip_ok && self.ports.map_or(true, |range| range.contains(port))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ip {
            IpSelector::Network(IpNetwork::V6(net)) => write!(f, "[{}]", net)?,
            IpSelector::Network(net) => write!(f, "{}", net)?,
            IpSelector::Host => f.write_str("host")?,
            IpSelector::Container => f.write_str("container")?,
        }
        match self.ports {
            None => Ok(()),
            Some(PortRange::ANY) => write!(f, ":*/{}", self.protocol),
            Some(r) if r.min == r.max => write!(f, ":{}/{}", r.min, self.protocol),
            Some(r) => write!(f, ":{}-{}/{}", r.min, r.max, self.protocol),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(FilterError::EmptyEntry);
        }
        let (ip, ports) = split_entry(entry)?;
        let ip = parse_ip(ip)?;
        let (ports, protocol) = match ports {
            Some(ports) => {
                let (range, protocol) = parse_ports(ports)?;
                (Some(range), protocol)
            }
            None => (None, Protocol::Tcp),
        };
        Ok(Filter {
            ip,
            ports,
            protocol,
        })
    }
}

/// An ordered set of filters; earlier entries take priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    filters: Vec<Filter>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list and appends it.
    ///
    /// Nothing is appended unless every entry parses.
    pub fn append(&mut self, list: &str) -> Result<(), FilterError> {
        let parsed = list
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Filter>, _>>()?;
        self.filters.extend(parsed);
        Ok(())
    }

    /// First filter admitting `(ip, port)`, if any.
    ///
    /// Fails only when `ip` is not an address.
    pub fn matches(
        &self,
        ip: &str,
        port: u16,
        internal: bool,
    ) -> Result<Option<&Filter>, FilterError> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| FilterError::InvalidIp(ip.to_string()))?;
        Ok(self.filters.iter().find(|f| f.matches(ip, port, internal)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }
}

impl FromStr for Filters {
    type Err = FilterError;

    fn from_str(list: &str) -> Result<Self, Self::Err> {
        let mut filters = Filters::new();
        filters.append(list)?;
        Ok(filters)
    }
}

impl fmt::Display for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, filter) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", filter)?;
        }
        Ok(())
    }
}

/// Splits `ip[:ports]`, allowing `[v6]:ports` and bare IPv6 without ports.
fn split_entry(entry: &str) -> Result<(&str, Option<&str>), FilterError> {
    if let Some(rest) = entry.strip_prefix('[') {
        let (ip, tail) = rest
            .split_once(']')
            .ok_or_else(|| FilterError::InvalidIp(entry.to_string()))?;
        if tail.is_empty() {
            return Ok((ip, None));
        }
        let ports = tail
            .strip_prefix(':')
            .ok_or_else(|| FilterError::InvalidPort(tail.to_string()))?;
        return Ok((ip, Some(ports)));
    }
    if entry.matches(':').count() > 1 {
        return Ok((entry, None));
    }
    Ok(match entry.split_once(':') {
        Some((ip, ports)) => (ip, Some(ports)),
        None => (entry, None),
    })
}

fn parse_ip(ip: &str) -> Result<IpSelector, FilterError> {
    let net = match ip {
        "host" => return Ok(IpSelector::Host),
        "container" => return Ok(IpSelector::Container),
        "0.0.0.0" => "0.0.0.0/0",
        "::" => "::/0",
        other => other,
    };
    net.parse::<IpNetwork>()
        .map(IpSelector::Network)
        .map_err(|_| FilterError::InvalidIp(ip.to_string()))
}

fn parse_ports(ports: &str) -> Result<(PortRange, Protocol), FilterError> {
    let (ports, protocol) = match ports.split_once('/') {
        Some((ports, proto)) => (ports, proto.parse()?),
        None => (ports, Protocol::Tcp),
    };
    let range = match ports {
        "*" => PortRange::ANY,
        _ => match ports.split_once('-') {
            Some((min, max)) => {
                let range = PortRange {
                    min: parse_port(min)?,
                    max: parse_port(max)?,
                };
                if range.min > range.max {
                    return Err(FilterError::InvalidRange(ports.to_string()));
                }
                range
            }
            None => {
                let port = parse_port(ports)?;
                PortRange {
                    min: port,
                    max: port,
                }
            }
        },
    };
    Ok((range, protocol))
}

fn parse_port(port: &str) -> Result<u16, FilterError> {
    port.trim()
        .parse()
        .map_err(|_| FilterError::InvalidPort(port.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(list: &str) -> Filters {
        let mut f = Filters::new();
        f.append(list).unwrap();
        f
    }

    fn hit(f: &Filters, ip: &str, port: u16, internal: bool) -> bool {
        f.matches(ip, port, internal).unwrap().is_some()
    }

    #[test]
    fn test_cidr_with_any_port() {
        let f = filters("192.168.1.0/24:*");
        for host in 0..=255u8 {
            let ip = format!("192.168.1.{}", host);
            for port in [0, 1, 80, 443, 8080, 65535] {
                assert!(hit(&f, &ip, port, false), "{}:{}", ip, port);
            }
        }
        for ip in ["192.168.0.255", "192.168.2.0", "10.0.0.1", "fe80::1"] {
            for port in [0, 80, 65535] {
                assert!(!hit(&f, ip, port, false), "{}:{}", ip, port);
            }
        }
    }

    #[test]
    fn test_single_address_and_port() {
        let f = filters("192.168.1.1:80");
        assert!(hit(&f, "192.168.1.1", 80, false));
        assert!(!hit(&f, "192.168.1.1", 81, false));
        assert!(!hit(&f, "192.168.1.2", 80, false));
    }

    #[test]
    fn test_wildcard_address_with_range() {
        let f = filters("0.0.0.0:80-82");
        for port in 80..=82 {
            assert!(hit(&f, "10.1.2.3", port, false));
            assert!(hit(&f, "172.16.0.1", port, true));
        }
        assert!(!hit(&f, "10.1.2.3", 83, false));
        assert!(!hit(&f, "10.1.2.3", 79, false));
    }

    #[test]
    fn test_host_and_container_roles() {
        let host = filters("host:80-82");
        assert!(hit(&host, "10.0.0.1", 81, false));
        assert!(!hit(&host, "10.0.0.1", 81, true));

        let container = filters("container:80-82");
        assert!(hit(&container, "10.0.0.1", 81, true));
        assert!(!hit(&container, "10.0.0.1", 81, false));
        assert!(!hit(&container, "10.0.0.1", 83, true));
    }

    #[test]
    fn test_portless_filter_ignores_port() {
        let f = filters("10.0.0.5");
        assert!(hit(&f, "10.0.0.5", 1, false));
        assert!(hit(&f, "10.0.0.5", 65535, true));
        assert!(!hit(&f, "10.0.0.6", 1, false));
        assert_eq!(f.iter().next().unwrap().ports, None);
    }

    #[test]
    fn test_first_match_wins() {
        let f = filters("10.0.0.0/8:80/udp, 10.0.0.0/8:*");
        let matched = f.matches("10.1.1.1", 80, false).unwrap().unwrap();
        assert_eq!(matched.protocol, Protocol::Udp);
        let matched = f.matches("10.1.1.1", 81, false).unwrap().unwrap();
        assert_eq!(matched.ports, Some(PortRange::ANY));
        assert_eq!(f.matches("11.0.0.1", 80, false).unwrap(), None);
    }

    #[test]
    fn test_protocol_defaults_to_tcp() {
        let f = filters("10.0.0.1:53/udp,10.0.0.1:53");
        let protocols: Vec<_> = f.iter().map(|f| f.protocol).collect();
        assert_eq!(protocols, vec![Protocol::Udp, Protocol::Tcp]);
    }

    #[test]
    fn test_ipv6_entries() {
        let f = filters("[fd00::1]:53/udp,fe80::/10");
        assert!(hit(&f, "fd00::1", 53, false));
        assert!(!hit(&f, "fd00::1", 54, false));
        assert!(hit(&f, "fe80::abcd", 9999, false));
    }

    #[test]
    fn test_ipv4_mapped_candidate() {
        let f = filters("10.0.0.0/8:*");
        assert!(hit(&f, "::ffff:10.0.0.1", 80, false));
        assert!(!hit(&f, "::ffff:11.0.0.1", 80, false));
        assert!(!hit(&f, "::10.0.0.1", 80, false));

        let mapped = filters("::ffff:0:0/96");
        assert!(hit(&mapped, "::ffff:10.0.0.1", 80, false));
    }

    #[test]
    fn test_parse_errors() {
        let err = |list: &str| list.parse::<Filters>().unwrap_err();
        assert_eq!(err(""), FilterError::EmptyEntry);
        assert_eq!(err("10.0.0.1,,10.0.0.2"), FilterError::EmptyEntry);
        assert!(matches!(err("10.0.0.300:80"), FilterError::InvalidIp(_)));
        assert!(matches!(err("nowhere:80"), FilterError::InvalidIp(_)));
        assert!(matches!(err("10.0.0.1:http"), FilterError::InvalidPort(_)));
        assert!(matches!(err("10.0.0.1:"), FilterError::InvalidPort(_)));
        assert!(matches!(err("10.0.0.1:70000"), FilterError::InvalidPort(_)));
        assert!(matches!(
            err("10.0.0.1:90-80"),
            FilterError::InvalidRange(_)
        ));
        assert!(matches!(
            err("10.0.0.1:80/sctp"),
            FilterError::UnknownProtocol(_)
        ));
    }

    #[test]
    fn test_failed_append_leaves_set_untouched() {
        let mut f = filters("10.0.0.1:80");
        assert!(f.append("10.0.0.2:80,bogus").is_err());
        assert_eq!(f.iter().count(), 1);
    }

    #[test]
    fn test_bad_candidate_address() {
        let f = filters("host");
        assert!(matches!(
            f.matches("not-an-ip", 80, false),
            Err(FilterError::InvalidIp(_))
        ));
    }

    #[test]
    fn test_display() {
        let f = filters("10.0.0.0/8:*,host:80-82/udp,container,[fd00::1]:53");
        assert_eq!(
            f.to_string(),
            "10.0.0.0/8:*/tcp,host:80-82/udp,container,[fd00::1/128]:53/tcp"
        );
        assert_eq!(f.to_string().parse::<Filters>().unwrap(), f);
    }
}
