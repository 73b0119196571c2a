//! Client IP normalization.

use std::net::{IpAddr, SocketAddr};

/// Normalize an address string to its canonical IP form: any `host:port`
/// suffix is stripped and IPv4-mapped IPv6 addresses collapse to their
/// IPv4 form. Returns `None` when the input is not an IP at all.
pub fn normalize_ip(addr: &str) -> Option<String> {
    let addr = addr.trim();
    let ip = if let Ok(sock) = addr.parse::<SocketAddr>() {
        sock.ip()
    } else {
        addr.parse::<IpAddr>().ok()?
    };
    Some(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    })
}

/// Compare two address strings after normalization. Non-IP inputs fall back
/// to a trimmed string comparison.
pub fn ip_equal(a: &str, b: &str) -> bool {
    match (normalize_ip(a), normalize_ip(b)) {
        (Some(na), Some(nb)) => na == nb,
        _ => a.trim() == b.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ports() {
        assert_eq!(normalize_ip("10.0.0.7:51234").as_deref(), Some("10.0.0.7"));
        assert_eq!(normalize_ip("[::1]:8080").as_deref(), Some("::1"));
    }

    #[test]
    fn canonicalizes_v4_in_v6() {
        assert_eq!(normalize_ip("::ffff:10.0.0.7").as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn non_ip_returns_none() {
        assert_eq!(normalize_ip("localhost"), None);
        assert_eq!(normalize_ip(""), None);
    }

    #[test]
    fn equality_covers_mixed_forms() {
        assert!(ip_equal("10.0.0.7", "10.0.0.7:443"));
        assert!(ip_equal("::ffff:10.0.0.7", "10.0.0.7"));
        assert!(ip_equal(" 10.0.0.7 ", "10.0.0.7"));
        assert!(!ip_equal("10.0.0.7", "10.0.0.8"));
        // Unparseable on either side degrades to trimmed string compare.
        assert!(ip_equal("localhost", " localhost"));
        assert!(!ip_equal("localhost", "10.0.0.7"));
    }
}
