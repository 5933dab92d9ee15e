//! Address patterns used to map hosts to physical locations.
//!
//! Three forms are accepted: an exact address, a glob where `*` matches any
//! run of characters (`10.1.*`, `*.rack7.*`), and CIDR (`10.0.0.0/8`).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty address pattern")]
    Empty,

    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressPattern {
    Exact(String),
    Glob(String),
    Cidr { network: IpAddr, prefix: u8 },
}

impl FromStr for AddressPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PatternError::Empty);
        }

        if let Some((net, prefix)) = s.split_once('/') {
            let network: IpAddr = net
                .parse()
                .map_err(|_| PatternError::InvalidCidr(s.to_string()))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| PatternError::InvalidCidr(s.to_string()))?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(PatternError::InvalidCidr(s.to_string()));
            }
            return Ok(AddressPattern::Cidr { network, prefix });
        }

        if s.contains('*') {
            Ok(AddressPattern::Glob(s.to_string()))
        } else {
            Ok(AddressPattern::Exact(s.to_string()))
        }
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPattern::Exact(s) | AddressPattern::Glob(s) => f.write_str(s),
            AddressPattern::Cidr { network, prefix } => write!(f, "{}/{}", network, prefix),
        }
    }
}

impl AddressPattern {
    pub fn matches(&self, address: &str) -> bool {
        let address = address.trim();
        match self {
            AddressPattern::Exact(s) => s == address,
            AddressPattern::Glob(g) => glob_match(g.as_bytes(), address.as_bytes()),
            AddressPattern::Cidr { network, prefix } => match address.parse::<IpAddr>() {
                Ok(addr) => cidr_contains(*network, *prefix, addr),
                Err(_) => false,
            },
        }
    }
}

fn cidr_contains(network: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (network, addr) {
        (IpAddr::V4(net), IpAddr::V4(a)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - u32::from(prefix));
            (u32::from(net) & mask) == (u32::from(a) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(a)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - u32::from(prefix));
            (u128::from(net) & mask) == (u128::from(a) & mask)
        }
        _ => false,
    }
}

/// `*` matches any (possibly empty) run of bytes; everything else is literal.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> AddressPattern {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact() {
        assert!(pat("10.0.0.1").matches("10.0.0.1"));
        assert!(!pat("10.0.0.1").matches("10.0.0.11"));
    }

    #[test]
    fn test_glob() {
        assert!(pat("10.1.*").matches("10.1.4.20"));
        assert!(!pat("10.1.*").matches("10.11.4.20"));
        assert!(pat("*.rack7.*").matches("db.rack7.dc1"));
        assert!(pat("10.*.0.1").matches("10.200.0.1"));
        assert!(!pat("10.*.0.1").matches("10.200.0.2"));
    }

    #[test]
    fn test_cidr_v4() {
        assert!(pat("10.2.0.0/16").matches("10.2.255.1"));
        assert!(!pat("10.2.0.0/16").matches("10.3.0.1"));
        assert!(pat("0.0.0.0/0").matches("192.168.1.1"));
        assert!(!pat("10.2.0.0/16").matches("not-an-ip"));
    }

    #[test]
    fn test_cidr_v6() {
        assert!(pat("fd00::/8").matches("fd12:3456::1"));
        assert!(!pat("fd00::/8").matches("10.0.0.1"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!("".parse::<AddressPattern>(), Err(PatternError::Empty));
        assert!("10.0.0.0/33".parse::<AddressPattern>().is_err());
        assert!("10.0.0/8x".parse::<AddressPattern>().is_err());
    }
}
