//! Session cookie helpers.

use axum::http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};

/// Value of the named cookie from a request's headers, if present.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k.trim() == name {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

/// `Set-Cookie` value establishing the session cookie.
pub fn session_cookie(name: &str, value: &str, with_tls: bool) -> HeaderValue {
    let mut s = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax");
    if with_tls {
        s.push_str("; Secure");
    }
    HeaderValue::from_str(&s).expect("cookie value is ascii")
}

/// `Set-Cookie` value deleting the session cookie.
pub fn expired_cookie(name: &str, with_tls: bool) -> HeaderValue {
    let mut s = format!(
        "{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT"
    );
    if with_tls {
        s.push_str("; Secure");
    }
    HeaderValue::from_str(&s).expect("cookie value is ascii")
}

/// Append a cookie-deleting header to a response header map.
pub fn expire_on(headers: &mut HeaderMap, name: &str, with_tls: bool) {
    headers.append(SET_COOKIE, expired_cookie(name, with_tls));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; X-S=abc123 ; other=1"),
        );
        assert_eq!(cookie_value(&headers, "X-S").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, "theme").as_deref(), Some("dark"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn no_cookie_header() {
        assert_eq!(cookie_value(&HeaderMap::new(), "X-S"), None);
    }

    #[test]
    fn session_cookie_attributes() {
        let v = session_cookie("X-S", "sid", false);
        let s = v.to_str().unwrap();
        assert!(s.starts_with("X-S=sid"));
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("SameSite=Lax"));
        assert!(!s.contains("Secure"));

        let v = session_cookie("X-S", "sid", true);
        assert!(v.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn expired_cookie_unsets() {
        let v = expired_cookie("X-S", false);
        let s = v.to_str().unwrap();
        assert!(s.contains("Max-Age=0"));
        assert!(s.contains("1970"));
    }
}
