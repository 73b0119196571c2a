//! Pure director: maps a request onto its agent target.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, HOST, USER_AGENT};
use sha2::{Digest, Sha256};

/// Where a request is forwarded and which headers ride along.
#[derive(Debug)]
pub struct UpstreamTarget {
    /// `host[:port]`, scheme stripped; the proxy→agent hop is plain http.
    pub host: String,
    pub headers: HeaderMap,
}

/// Strip any scheme prefix from an agent URL to obtain the bare host.
pub fn strip_scheme(agent_url: &str) -> &str {
    agent_url
        .strip_prefix("http://")
        .or_else(|| agent_url.strip_prefix("https://"))
        .unwrap_or(agent_url)
}

/// Build the forwarding target for the user's agent.
pub fn direct_to_agent(
    agent_url: &str,
    with_tls: bool,
    real_ip: &str,
    user_agent: &str,
    agent_key: &str,
    session_id: &str,
) -> UpstreamTarget {
    let host = strip_scheme(agent_url).to_string();
    let mut headers = HeaderMap::new();

    let insert = |headers: &mut HeaderMap, name: HeaderName, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(name, v);
        }
    };

    insert(&mut headers, HOST, &host);
    insert(&mut headers, HeaderName::from_static("x-real-ip"), real_ip);
    insert(
        &mut headers,
        HeaderName::from_static("x-forwarded-for"),
        real_ip,
    );
    insert(
        &mut headers,
        HeaderName::from_static("x-forwarded-proto"),
        if with_tls { "https" } else { "http" },
    );
    insert(&mut headers, USER_AGENT, user_agent);
    insert(
        &mut headers,
        HeaderName::from_static("x-agent-key"),
        agent_key,
    );
    if !session_id.is_empty() {
        insert(
            &mut headers,
            HeaderName::from_static("x-session-id"),
            session_id,
        );
    }

    UpstreamTarget { host, headers }
}

/// Connection id for the session registry: the backing session id plus the
/// query string for operator visibility, with the reconnection token value
/// replaced by a short hash so listings never expose a live token.
pub fn conn_id(session_id: &str, query: &str) -> String {
    format!("{session_id} | {}", mask_reconnection_token(query))
}

fn mask_reconnection_token(query: &str) -> String {
    query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if k == "reconnectionToken" => {
                let digest = Sha256::digest(v.as_bytes());
                let hex: String = digest
                    .iter()
                    .take(8)
                    .map(|b| format!("{b:02x}"))
                    .collect();
                format!("{k}={hex}")
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_schemes() {
        assert_eq!(strip_scheme("http://agent-1:9000"), "agent-1:9000");
        assert_eq!(strip_scheme("https://agent-1:9000"), "agent-1:9000");
        assert_eq!(strip_scheme("agent-1:9000"), "agent-1:9000");
    }

    #[test]
    fn director_sets_forwarding_headers() {
        let target = direct_to_agent(
            "http://agent-1:9000",
            true,
            "10.0.0.7",
            "Mozilla/5.0",
            "sekrit",
            "s1",
        );
        assert_eq!(target.host, "agent-1:9000");
        assert_eq!(target.headers.get(HOST).unwrap(), "agent-1:9000");
        assert_eq!(target.headers.get("x-real-ip").unwrap(), "10.0.0.7");
        assert_eq!(target.headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(target.headers.get("x-agent-key").unwrap(), "sekrit");
        assert_eq!(target.headers.get("x-session-id").unwrap(), "s1");
        assert_eq!(target.headers.get(USER_AGENT).unwrap(), "Mozilla/5.0");
    }

    #[test]
    fn plain_http_forwarded_proto() {
        let target = direct_to_agent("agent-1:9000", false, "ip", "ua", "k", "");
        assert_eq!(target.headers.get("x-forwarded-proto").unwrap(), "http");
        assert!(target.headers.get("x-session-id").is_none());
    }

    #[test]
    fn conn_id_masks_the_reconnection_token() {
        let id = conn_id("s1", "reconnectionToken=supersecret&skipWebSocketFrames=false");
        assert!(id.starts_with("s1 | reconnectionToken="));
        assert!(!id.contains("supersecret"));
        assert!(id.ends_with("&skipWebSocketFrames=false"));
        // 8 bytes -> 16 hex chars.
        let masked = id
            .split("reconnectionToken=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert_eq!(masked.len(), 16);
        assert!(masked.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn conn_id_is_stable_per_token() {
        let a = conn_id("s1", "reconnectionToken=abc");
        let b = conn_id("s1", "reconnectionToken=abc");
        let c = conn_id("s1", "reconnectionToken=def");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
