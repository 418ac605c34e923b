//! Range specification grammar
//!
//! Three forms: `A.B.C.D` (single host), `A.B.C.D-N` (last-octet span), and
//! CIDR `A.B.C.D/NN` (usable hosts only).

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::error::{CoreError, CoreResult};

/// A parsed range: the original spec plus the expanded address list.
#[derive(Debug, Clone)]
pub struct IpRange {
    pub spec: String,
    pub ips: Vec<Ipv4Addr>,
}

impl IpRange {
    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

/// Validation result for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ips: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse a range specification into its address list.
pub fn parse_range(spec: &str) -> CoreResult<IpRange> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(CoreError::invalid("empty range specification"));
    }

    let ips = if let Some((base, prefix)) = spec.split_once('/') {
        parse_cidr(spec, base, prefix)?
    } else if let Some((base, end)) = spec.rsplit_once('-') {
        parse_span(spec, base, end)?
    } else {
        vec![parse_ip(spec)?]
    };

    Ok(IpRange {
        spec: spec.to_string(),
        ips,
    })
}

/// Validate without scanning; never fails.
pub fn validate_range(spec: &str) -> RangeValidation {
    match parse_range(spec) {
        Ok(range) => {
            let sample_ips = range
                .ips
                .iter()
                .take(5)
                .map(|ip| ip.to_string())
                .collect();
            RangeValidation {
                valid: true,
                total_ips: Some(range.ips.len() as u32),
                first_ip: range.ips.first().map(|ip| ip.to_string()),
                last_ip: range.ips.last().map(|ip| ip.to_string()),
                sample_ips,
                error: None,
            }
        }
        Err(e) => RangeValidation {
            valid: false,
            total_ips: None,
            first_ip: None,
            last_ip: None,
            sample_ips: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

fn parse_ip(raw: &str) -> CoreResult<Ipv4Addr> {
    raw.parse()
        .map_err(|_| CoreError::invalid(format!("not an IPv4 address: {}", raw)))
}

fn parse_cidr(spec: &str, base: &str, prefix: &str) -> CoreResult<Vec<Ipv4Addr>> {
    let base_ip = parse_ip(base)?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| CoreError::invalid(format!("bad prefix length in {}", spec)))?;
    if !(16..=32).contains(&prefix) {
        return Err(CoreError::invalid(format!(
            "prefix /{} out of supported range /16-/32",
            prefix
        )));
    }

    let network = Ipv4Network::new(base_ip, prefix)
        .map_err(|e| CoreError::invalid(format!("bad network {}: {}", spec, e)))?;

    if prefix >= 31 {
        return Ok(network.iter().collect());
    }

    let network_addr = network.network();
    let broadcast = network.broadcast();
    Ok(network
        .iter()
        .filter(|ip| *ip != network_addr && *ip != broadcast)
        .collect())
}

fn parse_span(spec: &str, base: &str, end: &str) -> CoreResult<Vec<Ipv4Addr>> {
    let base_ip = parse_ip(base)?;
    let end_octet: u8 = end
        .parse()
        .map_err(|_| CoreError::invalid(format!("bad end octet in {}", spec)))?;

    let octets = base_ip.octets();
    if end_octet < octets[3] {
        return Err(CoreError::invalid(format!(
            "end octet {} precedes start {} in {}",
            end_octet, octets[3], spec
        )));
    }

    Ok((octets[3]..=end_octet)
        .map(|last| Ipv4Addr::new(octets[0], octets[1], octets[2], last))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_host() {
        let range = parse_range("192.168.1.1").unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range.ips[0], Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_degenerate_span() {
        let range = parse_range("192.168.1.1-1").unwrap();
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn test_full_span() {
        let range = parse_range("192.168.1.1-254").unwrap();
        assert_eq!(range.len(), 254);
        assert_eq!(*range.ips.last().unwrap(), Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_slash_24_excludes_network_and_broadcast() {
        let range = parse_range("10.0.0.0/24").unwrap();
        assert_eq!(range.len(), 254);
        assert_eq!(range.ips[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(*range.ips.last().unwrap(), Ipv4Addr::new(10, 0, 0, 254));
    }

    #[test]
    fn test_parse_round_trip_preserves_set() {
        for spec in ["192.168.1.5", "192.168.1.10-20", "10.1.2.0/28"] {
            let first = parse_range(spec).unwrap();
            let again = parse_range(&first.spec).unwrap();
            assert_eq!(first.ips, again.ips, "{} should round-trip", spec);
        }
    }

    #[test]
    fn test_invalid_specs() {
        for spec in [
            "",
            "not-an-ip",
            "300.1.1.1",
            "192.168.1.10-5",
            "192.168.1.0/8",
            "192.168.1.0/33",
            "192.168.1.1-x",
        ] {
            assert!(parse_range(spec).is_err(), "{} should be rejected", spec);
        }
    }

    #[test]
    fn test_validation_surface() {
        let ok = validate_range("192.168.1.1-254");
        assert!(ok.valid);
        assert_eq!(ok.total_ips, Some(254));
        assert_eq!(ok.first_ip.as_deref(), Some("192.168.1.1"));
        assert_eq!(ok.last_ip.as_deref(), Some("192.168.1.254"));
        assert_eq!(ok.sample_ips.len(), 5);

        let bad = validate_range("bogus");
        assert!(!bad.valid);
        assert!(bad.error.is_some());
        assert!(bad.sample_ips.is_empty());
    }
}
