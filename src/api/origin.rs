//! Hostname allow-list check run before a WebSocket upgrade.

/// Loopback literals accepted whenever `localhost` is allowed.
const LOOPBACK_ALIASES: [&str; 2] = ["127.0.0.1", "::1"];

/// Strip an optional port from a `Host` value.
///
/// Handles `name:port`, `[v6]:port`, `[v6]` and bare IPv6 literals (which are
/// returned unchanged since their colons are not a port separator).
pub fn hostname_of(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }
    match host.rfind(':') {
        Some(idx) if host[..idx].find(':').is_none() => &host[..idx],
        _ => host,
    }
}

/// Decide whether a request for `host` may open a shell session.
pub fn is_host_allowed(host: &str, allowed: &[String]) -> bool {
    if allowed.iter().any(|h| h == "*") {
        return true;
    }

    let requester = hostname_of(host);
    if allowed.iter().any(|h| h == "localhost") && LOOPBACK_ALIASES.contains(&requester) {
        return true;
    }
    if allowed.iter().any(|h| h == requester) {
        return true;
    }

    tracing::warn!(
        hostname = %requester,
        allowed = ?allowed,
        "Rejected shell upgrade from host not in allow-list"
    );
    false
}
