//! Content-type inference from URL suffixes.
//!
//! code-server occasionally serves static assets with a missing or wrong
//! content type; the proxy stamps the correct one based on the path.

/// MIME type for a URL path by suffix, or `None` when unknown.
pub fn from_url_suffix(path: &str) -> Option<&'static str> {
    if path.ends_with(".js") {
        Some("application/javascript")
    } else if path.ends_with(".json") {
        Some("application/json")
    } else if path.ends_with(".ts") || path.ends_with(".tsx") {
        Some("application/typescript")
    } else if path.ends_with(".png") {
        Some("image/png")
    } else if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        Some("image/jpeg")
    } else if path.ends_with(".gif") {
        Some("image/gif")
    } else if path.ends_with(".svg") {
        Some("image/svg+xml")
    } else if path.ends_with(".webp") {
        Some("image/webp")
    } else if path.ends_with(".css") {
        Some("text/css")
    } else if path.ends_with(".wasm") {
        Some("application/wasm")
    } else if path.ends_with(".bin") || path.ends_with(".pkl") || path.ends_with(".pickle") {
        Some("application/octet-stream")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_suffixes() {
        assert_eq!(from_url_suffix("/a/vsda.js"), Some("application/javascript"));
        assert_eq!(from_url_suffix("/x/vsda_bg.wasm"), Some("application/wasm"));
        assert_eq!(from_url_suffix("/theme.css"), Some("text/css"));
        assert_eq!(from_url_suffix("/m.pickle"), Some("application/octet-stream"));
        assert_eq!(from_url_suffix("/api/stream"), None);
    }

    #[test]
    fn inference_is_idempotent() {
        // Rerunning on the same path never changes the answer.
        for path in ["/a.js", "/b.json", "/c.unknown"] {
            assert_eq!(from_url_suffix(path), from_url_suffix(path));
        }
    }
}
