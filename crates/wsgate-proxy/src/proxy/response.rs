//! Response mutator applied to everything coming back from an agent.

use axum::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::StatusCode;

use wsgate::mime;

/// Whether a 404 for this path is passed through untouched. Historical
/// behavior: only the code-server signing assets get their content type
/// fixed up; every other 404 body is left exactly as the upstream sent it.
pub fn passthrough_404(path: &str, status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
        && !path.ends_with("vsda.js")
        && !path.ends_with("vsda_bg.wasm")
}

/// Whether the rewritten path addresses an SSE upstream.
pub fn is_sse_request_path(path: &str) -> bool {
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    parts.len() >= 4 && parts[0] == "request" && {
        let proto = parts[2].to_lowercase();
        proto == "sse" || proto == "sse-https"
    }
}

/// Apply the content-type and SSE mutations in place.
pub fn mutate_response_headers(path: &str, status: StatusCode, headers: &mut HeaderMap) {
    if passthrough_404(path, status) {
        return;
    }

    if let Some(mime) = mime::from_url_suffix(path) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(mime));
    }

    if is_sse_request_path(path) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_404s_pass_through() {
        assert!(passthrough_404("/some/missing", StatusCode::NOT_FOUND));
        assert!(!passthrough_404("/static/vsda.js", StatusCode::NOT_FOUND));
        assert!(!passthrough_404("/static/vsda_bg.wasm", StatusCode::NOT_FOUND));
        assert!(!passthrough_404("/some/missing", StatusCode::OK));
    }

    #[test]
    fn mime_is_stamped_on_non_404() {
        let mut headers = HeaderMap::new();
        mutate_response_headers("/assets/app.js", StatusCode::OK, &mut headers);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/javascript");
    }

    #[test]
    fn mime_not_stamped_on_passthrough_404() {
        let mut headers = HeaderMap::new();
        mutate_response_headers("/assets/app.js", StatusCode::NOT_FOUND, &mut headers);
        assert!(headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn vsda_404_still_gets_mime() {
        let mut headers = HeaderMap::new();
        mutate_response_headers("/static/vsda.js", StatusCode::NOT_FOUND, &mut headers);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/javascript");
    }

    #[test]
    fn sse_paths_get_stream_headers() {
        assert!(is_sse_request_path("/request/alice/sse/8080/stream"));
        assert!(is_sse_request_path("/request/alice/sse-https/8080/x"));
        assert!(!is_sse_request_path("/request/alice/http/8080/x"));
        assert!(!is_sse_request_path("/request/alice/sse"));

        let mut headers = HeaderMap::new();
        mutate_response_headers(
            "/request/alice/sse/8080/stream",
            StatusCode::OK,
            &mut headers,
        );
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/event-stream");
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(headers.get(CONNECTION).unwrap(), "keep-alive");
    }

    #[test]
    fn mutation_is_idempotent() {
        let mut once = HeaderMap::new();
        mutate_response_headers("/a.css", StatusCode::OK, &mut once);
        let mut twice = once.clone();
        mutate_response_headers("/a.css", StatusCode::OK, &mut twice);
        assert_eq!(once, twice);
    }
}
