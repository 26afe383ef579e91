//! Transport candidate filter with network scope policy.
//!
//! Lan mode: accept only private/link-local IPs (RFC 1918, RFC 4193, loopback).
//! Overlay mode: Lan + CGNAT 100.64.0.0/10 (e.g. Tailscale).
//! Global mode: accept all valid IPs (private + public + CGNAT).
//! All modes reject candidates whose address does not parse.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Network scope policy for candidate filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetworkScope {
    /// Only private/link-local/loopback IPs.
    Lan,
    /// Lan + CGNAT 100.64.0.0/10.
    Overlay,
    /// All valid IPs including public and CGNAT.
    Global,
}

impl FromStr for NetworkScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lan" => Ok(Self::Lan),
            "overlay" => Ok(Self::Overlay),
            "global" => Ok(Self::Global),
            other => Err(format!(
                "unknown scope {:?} (expected lan, overlay, or global)",
                other
            )),
        }
    }
}

/// Returns `true` if a candidate address (`ip:port`) is allowed under the
/// given network scope policy. Unparseable addresses are rejected in every
/// scope — a candidate we cannot classify is not dialed.
pub fn is_allowed_candidate(address: &str, scope: NetworkScope) -> bool {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return false;
    }

    let sock: SocketAddr = match trimmed.parse() {
        Ok(s) => s,
        Err(_) => return false,
    };
    let ip = sock.ip();

    match scope {
        NetworkScope::Lan => is_private_or_link_local(&ip),
        NetworkScope::Overlay => is_private_or_link_local(&ip) || is_cgnat(&ip),
        NetworkScope::Global => true,
    }
}

/// Returns `true` if the IP is private (RFC 1918 / RFC 4193) or link-local.
fn is_private_or_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            // 10.0.0.0/8
            if octets[0] == 10 {
                return true;
            }
            // 172.16.0.0/12
            if octets[0] == 172 && (16..=31).contains(&octets[1]) {
                return true;
            }
            // 192.168.0.0/16
            if octets[0] == 192 && octets[1] == 168 {
                return true;
            }
            // 169.254.0.0/16 (link-local)
            if octets[0] == 169 && octets[1] == 254 {
                return true;
            }
            // 127.0.0.0/8 (loopback — accept for local testing)
            if octets[0] == 127 {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            // fe80::/10 (link-local)
            if segments[0] & 0xffc0 == 0xfe80 {
                return true;
            }
            // fc00::/7 (unique local — covers fc00::/8 and fd00::/8)
            if segments[0] & 0xfe00 == 0xfc00 {
                return true;
            }
            // ::1 (loopback)
            if v6.is_loopback() {
                return true;
            }
            false
        }
    }
}

/// Returns `true` if the IP is in the CGNAT range 100.64.0.0/10.
fn is_cgnat(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            // 100.64.0.0/10: first octet 100, second octet 64..127
            octets[0] == 100 && (64..=127).contains(&octets[1])
        }
        IpAddr::V6(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lan(address: &str) -> bool {
        is_allowed_candidate(address, NetworkScope::Lan)
    }

    // ── Private/link-local IPv4 — ACCEPT ──────────────────────

    #[test]
    fn accept_10_network() {
        assert!(lan("10.0.0.1:12345"), "10.0.0.0/8 must be accepted");
    }

    #[test]
    fn accept_172_16_network() {
        assert!(lan("172.16.0.1:12345"), "172.16.0.0/12 must be accepted");
    }

    #[test]
    fn accept_172_31_network() {
        assert!(lan("172.31.255.255:12345"), "172.31.x.x must be accepted");
    }

    #[test]
    fn accept_192_168_network() {
        assert!(lan("192.168.1.100:12345"), "192.168.0.0/16 must be accepted");
    }

    #[test]
    fn accept_link_local_ipv4() {
        assert!(lan("169.254.1.1:12345"), "169.254.0.0/16 must be accepted");
    }

    #[test]
    fn accept_loopback_ipv4() {
        assert!(lan("127.0.0.1:12345"), "127.0.0.1 must be accepted");
    }

    // ── Private/link-local IPv6 — ACCEPT ──────────────────────

    #[test]
    fn accept_link_local_ipv6() {
        assert!(lan("[fe80::1]:12345"), "fe80::/10 must be accepted");
    }

    #[test]
    fn accept_unique_local_ipv6() {
        assert!(lan("[fd00::1]:12345"), "fd00::/8 must be accepted");
    }

    // ── Public IPs — REJECT in Lan ────────────────────────────

    #[test]
    fn reject_public_ipv4() {
        assert!(!lan("203.0.113.5:12345"), "public IPv4 must be rejected");
    }

    #[test]
    fn reject_public_ipv6() {
        assert!(!lan("[2001:db8::1]:12345"), "public IPv6 must be rejected");
    }

    #[test]
    fn reject_172_15_not_private() {
        assert!(!lan("172.15.0.1:12345"), "172.15.x.x is not RFC1918");
    }

    #[test]
    fn reject_172_32_not_private() {
        assert!(!lan("172.32.0.1:12345"), "172.32.x.x is not RFC1918");
    }

    // ── Malformed — REJECT (all scopes) ───────────────────────

    #[test]
    fn reject_empty() {
        assert!(!lan(""), "empty must be rejected");
    }

    #[test]
    fn reject_missing_port() {
        assert!(!lan("192.168.1.1"), "bare IP without port must be rejected");
    }

    #[test]
    fn reject_garbage_address() {
        assert!(!lan("notanip:12345"), "non-IP must be rejected");
    }

    #[test]
    fn reject_hostname() {
        // Names cannot be scope-classified, even plausible local ones.
        assert!(!lan("printer.local:12345"), "hostnames must be rejected");
    }

    // ── Global scope — ACCEPT public IPs ──────────────────────

    #[test]
    fn global_accepts_public_ipv4() {
        assert!(
            is_allowed_candidate("203.0.113.5:12345", NetworkScope::Global),
            "global must accept public IPv4"
        );
    }

    #[test]
    fn global_accepts_public_ipv6() {
        assert!(
            is_allowed_candidate("[2001:db8::1]:12345", NetworkScope::Global),
            "global must accept public IPv6"
        );
    }

    #[test]
    fn global_accepts_cgnat_100_64_range() {
        assert!(
            is_allowed_candidate("100.64.0.1:12345", NetworkScope::Global),
            "global must accept CGNAT 100.64/10"
        );
    }

    #[test]
    fn global_accepts_private_ipv4() {
        assert!(
            is_allowed_candidate("192.168.1.1:12345", NetworkScope::Global),
            "global must accept private IPv4 (superset)"
        );
    }

    #[test]
    fn global_rejects_garbage() {
        assert!(
            !is_allowed_candidate("notanip:12345", NetworkScope::Global),
            "global must reject non-IP"
        );
    }

    // ── CGNAT — Overlay accepts, Lan rejects ──────────────────

    #[test]
    fn lan_rejects_cgnat_100_64_range() {
        assert!(!lan("100.64.0.1:12345"), "lan must reject CGNAT 100.64/10");
    }

    #[test]
    fn overlay_accepts_cgnat_ipv4() {
        assert!(
            is_allowed_candidate("100.74.48.28:12345", NetworkScope::Overlay),
            "overlay must accept CGNAT 100.64/10 (Tailscale)"
        );
    }

    #[test]
    fn overlay_accepts_private_ipv4() {
        assert!(
            is_allowed_candidate("192.168.1.1:12345", NetworkScope::Overlay),
            "overlay must accept private IPv4 (superset of Lan)"
        );
    }

    #[test]
    fn overlay_rejects_public_ipv4() {
        assert!(
            !is_allowed_candidate("203.0.113.5:12345", NetworkScope::Overlay),
            "overlay must reject public IPv4"
        );
    }

    #[test]
    fn overlay_accepts_cgnat_boundary_low() {
        assert!(
            is_allowed_candidate("100.64.0.1:12345", NetworkScope::Overlay),
            "overlay must accept 100.64.0.1 (low boundary)"
        );
    }

    #[test]
    fn overlay_accepts_cgnat_boundary_high() {
        assert!(
            is_allowed_candidate("100.127.255.254:12345", NetworkScope::Overlay),
            "overlay must accept 100.127.255.254 (high boundary)"
        );
    }

    #[test]
    fn overlay_rejects_outside_cgnat() {
        assert!(
            !is_allowed_candidate("100.128.0.1:12345", NetworkScope::Overlay),
            "overlay must reject 100.128.0.1 (outside 100.64/10)"
        );
    }

    // ── Scope parsing ─────────────────────────────────────────

    #[test]
    fn scope_from_str() {
        assert_eq!("lan".parse::<NetworkScope>().unwrap(), NetworkScope::Lan);
        assert_eq!(
            "overlay".parse::<NetworkScope>().unwrap(),
            NetworkScope::Overlay
        );
        assert_eq!(
            "global".parse::<NetworkScope>().unwrap(),
            NetworkScope::Global
        );
        assert!("wan".parse::<NetworkScope>().is_err());
    }
}
