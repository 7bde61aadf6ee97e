//! Device identity derived from client address and user agent
//!
//! Callers that cannot supply a stable device id can derive one from the
//! request: the same client IP and `User-Agent` always map to the same id.

use sha2::{Digest, Sha256};

/// Stable device id: lowercase hex SHA-256 of `"{client_ip}|{user_agent}"`.
pub fn derive_device_id(client_ip: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{client_ip}|{user_agent}").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Resolve the originating client IP.
///
/// Precedence: first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
/// socket address with the port and IPv6 brackets stripped.
pub fn client_ip(forwarded_for: Option<&str>, real_ip: Option<&str>, remote_addr: &str) -> String {
    if let Some(xff) = forwarded_for.filter(|v| !v.is_empty()) {
        let first = xff.split(',').next().unwrap_or(xff);
        return first.trim().to_string();
    }

    if let Some(xri) = real_ip.filter(|v| !v.is_empty()) {
        return xri.trim().to_string();
    }

    let host = match remote_addr.rfind(':') {
        Some(idx) => &remote_addr[..idx],
        None => remote_addr,
    };
    host.trim_matches(|c| c == '[' || c == ']').to_string()
}
