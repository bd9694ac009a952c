use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use axum::{extract::ConnectInfo, http::HeaderMap};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// In-process rate limiter keyed by an arbitrary string (IP, user id, email...)
pub type KeyedRateLimiter = Arc<RateLimiter<String, DashMapStateStore<String>, DefaultClock>>;

/// Create a keyed in-process rate limiter allowing `attempts` per `window_seconds`.
pub fn create_keyed_rate_limiter(attempts: u32, window_seconds: u64) -> KeyedRateLimiter {
    let attempts = attempts.max(1);
    let window_ms = (window_seconds.max(1) * 1000) / attempts as u64;
    let period = Duration::from_millis(window_ms.max(1));
    let burst = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst);

    Arc::new(RateLimiter::dashmap(quota))
}

/// Check a key against a keyed limiter.
///
/// Returns `Err(retry_after_seconds)` when the key is over quota.
pub fn check_keyed(limiter: &KeyedRateLimiter, key: &str) -> Result<(), u64> {
    match limiter.check_key(&key.to_string()) {
        Ok(_) => Ok(()),
        Err(negative) => {
            let wait_time = negative.wait_time_from(DefaultClock::default().now());
            Err(wait_time.as_secs().max(1))
        }
    }
}

/// Resolve the caller IP.
///
/// `x-forwarded-for` is honored only when the peer is one of
/// `trusted_proxies`; the hops are then walked right to left and the first
/// address that is not itself a trusted proxy is the caller.
pub fn client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trusted_proxies: &[IpAddr],
) -> Option<IpAddr> {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip())?;
    if !trusted_proxies.contains(&peer) {
        return Some(peer);
    }

    let forwarded_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| {
            s.rsplit(',')
                .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
                .find(|ip| !trusted_proxies.contains(ip))
        });

    Some(forwarded_ip.unwrap_or(peer))
}
