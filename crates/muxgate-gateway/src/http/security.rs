// SPDX-License-Identifier: Apache-2.0
//! Security headers and CSRF protection, applied to every HTTP response
//! regardless of the Non-goals that scope out a metrics/admin surface.

use axum::{
    extract::Request,
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

static NO_SNIFF: HeaderValue = HeaderValue::from_static("nosniff");
static DENY_FRAME: HeaderValue = HeaderValue::from_static("DENY");
static NO_REFERRER: HeaderValue = HeaderValue::from_static("no-referrer");
static PERMISSIONS: HeaderValue = HeaderValue::from_static("camera=(), microphone=(), geolocation=()");
static CSP: HeaderValue = HeaderValue::from_static(
    "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
     img-src 'self' data:; connect-src 'self'; frame-ancestors 'none'; \
     base-uri 'none'; object-src 'none'",
);

pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    h.insert(axum::http::header::X_CONTENT_TYPE_OPTIONS, NO_SNIFF.clone());
    h.insert(axum::http::header::X_FRAME_OPTIONS, DENY_FRAME.clone());
    h.insert(axum::http::header::REFERRER_POLICY, NO_REFERRER.clone());
    h.insert("permissions-policy", PERMISSIONS.clone());
    h.insert(axum::http::header::CONTENT_SECURITY_POLICY, CSP.clone());
    resp
}

/// Reject cross-origin mutating requests. SSE GETs are unaffected; only
/// POST/PUT/PATCH/DELETE are checked.
pub async fn csrf_guard(req: Request, next: Next) -> Response {
    if is_mutating_method(req.method()) {
        if let Some(reason) = should_reject_cross_origin(req.headers()) {
            return (StatusCode::FORBIDDEN, reason).into_response();
        }
    }
    next.run(req).await
}

fn is_mutating_method(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

fn should_reject_cross_origin(headers: &axum::http::HeaderMap) -> Option<&'static str> {
    if let Some(sfs) = headers.get("sec-fetch-site").and_then(|v| v.to_str().ok()) {
        if sfs.eq_ignore_ascii_case("cross-site") {
            return Some("Forbidden: cross-site request");
        }
        return None;
    }

    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !is_loopback_origin(origin) {
            return Some("Forbidden: cross-origin request");
        }
        return None;
    }

    if let Some(referer) = headers.get(axum::http::header::REFERER).and_then(|v| v.to_str().ok()) {
        if !is_loopback_origin(referer) {
            return Some("Forbidden: cross-origin referer");
        }
    }

    // Non-browser clients send no Origin/Referer — not a CSRF vector.
    None
}

fn is_loopback_origin(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.") || url.contains("[::1]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut m = HeaderMap::new();
        for (k, v) in pairs {
            m.insert(
                axum::http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        m
    }

    #[test]
    fn cross_site_sec_fetch_site_is_rejected() {
        let h = headers_with(&[("sec-fetch-site", "cross-site")]);
        assert!(should_reject_cross_origin(&h).is_some());
    }

    #[test]
    fn same_origin_sec_fetch_site_is_allowed() {
        let h = headers_with(&[("sec-fetch-site", "same-origin")]);
        assert!(should_reject_cross_origin(&h).is_none());
    }

    #[test]
    fn cross_origin_header_is_rejected() {
        let h = headers_with(&[("origin", "https://evil.com")]);
        assert!(should_reject_cross_origin(&h).is_some());
    }

    #[test]
    fn localhost_origin_is_allowed() {
        let h = headers_with(&[("origin", "http://localhost:8080")]);
        assert!(should_reject_cross_origin(&h).is_none());
    }

    #[test]
    fn no_origin_no_referer_is_allowed() {
        assert!(should_reject_cross_origin(&HeaderMap::new()).is_none());
    }

    #[test]
    fn post_is_mutating_get_is_not() {
        assert!(is_mutating_method(&Method::POST));
        assert!(!is_mutating_method(&Method::GET));
    }
}
