// SPDX-License-Identifier: Apache-2.0
//! HTTP bearer-token authentication middleware and per-IP rate limiting on
//! failed attempts, adapted to resolve through the Auth Gate rather than a
//! single static token.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use tracing::warn;

use muxgate_core::auth::Credential;
use muxgate_core::model::Principal;

use crate::http::AppState;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Rate limiter over failed-auth attempts, keyed by caller IP.
pub struct FailureLimiter {
    limiter: IpLimiter,
}

impl FailureLimiter {
    pub fn new(max_per_minute: u32, burst: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(max_per_minute).expect("max_per_minute must be > 0"))
            .allow_burst(NonZeroU32::new(burst).expect("burst must be > 0"));
        Self { limiter: RateLimiter::keyed(quota) }
    }
}

impl Default for FailureLimiter {
    fn default() -> Self {
        Self::new(5, 2)
    }
}

/// Resolved identity attached to the request by [`bearer_auth_mw`].
#[derive(Clone)]
pub struct AuthenticatedPrincipal(pub Principal);

/// Verifies `Authorization: Bearer <token>` against the Auth Gate and
/// attaches the resolved [`Principal`] to the request's extensions.
/// Rate-limits only failed attempts so legitimate traffic is never
/// throttled by its own volume; loopback callers are exempt entirely.
pub async fn bearer_auth_mw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = addr.ip();

    let Some(token) = extract_bearer(req.headers()) else {
        return reject(&state, ip).await;
    };

    match state
        .auth
        .authenticate(Credential::BearerToken(token.to_string()), chrono::Utc::now().timestamp())
        .await
    {
        Ok(principal) => {
            req.extensions_mut().insert(AuthenticatedPrincipal(principal));
            next.run(req).await
        }
        Err(_) => reject(&state, ip).await,
    }
}

async fn reject(state: &AppState, ip: IpAddr) -> Response {
    if !is_loopback(ip) {
        if state.failure_limiter.limiter.check_key(&ip).is_err() {
            warn!(%ip, "rate limit exceeded after repeated auth failures");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(axum::http::header::RETRY_AFTER, "60")],
                "Too Many Requests",
            )
                .into_response();
        }
    }
    warn!(%ip, "authentication failed");
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    auth.strip_prefix("Bearer ")
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Whether `principal` holds an admin-conferring role, per §4.10's role set
/// attached to the request context.
pub async fn is_admin(ledger: &Arc<dyn muxgate_core::LedgerStore>, principal: &Principal) -> bool {
    match ledger.list_roles(&principal.id).await {
        Ok(roles) => roles.iter().any(|r| r.role.is_admin()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_from_valid_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("abc"));
    }

    #[test]
    fn extract_bearer_missing_header() {
        assert!(extract_bearer(&HeaderMap::new()).is_none());
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn loopback_v4_is_loopback() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn non_loopback_is_not_loopback() {
        assert!(!is_loopback("10.0.0.5".parse().unwrap()));
    }
}
