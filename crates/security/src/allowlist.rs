//! Allowlist policies — who may talk to the bot, and which URLs tools may fetch.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use parley_config::AccessConfig;
use parley_core::AccessGate;

/// Result of checking a sender against the allowlist.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderCheckResult {
    /// Sender is allowed
    Allowed,
    /// Sender is denied
    Denied { sender_id: String, reason: String },
}

/// User allowlist backed by the `[access]` config section.
///
/// Rules:
/// - Admins are always allowed
/// - If `allowed_users` is empty → deny everyone else (secure by default)
/// - If `allowed_users` contains `"*"` → allow all
/// - Otherwise, the user must be in the list
#[derive(Debug, Clone, Default)]
pub struct AllowlistGate {
    allowed: HashSet<String>,
    admins: HashSet<String>,
    wildcard: bool,
}

impl AllowlistGate {
    pub fn new(allowed_users: &[String], admin_ids: &[String]) -> Self {
        Self {
            wildcard: allowed_users.iter().any(|u| u == "*"),
            allowed: allowed_users.iter().filter(|u| *u != "*").cloned().collect(),
            admins: admin_ids.iter().cloned().collect(),
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(&config.allowed_users, &config.admin_ids)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    pub fn check_sender(&self, user_id: &str) -> SenderCheckResult {
        if self.wildcard || self.is_admin(user_id) || self.allowed.contains(user_id) {
            return SenderCheckResult::Allowed;
        }
        let reason = if self.allowed.is_empty() {
            "No users configured (deny by default)".to_string()
        } else {
            format!(
                "Sender '{}' not in allowlist ({} users configured)",
                user_id,
                self.allowed.len()
            )
        };
        SenderCheckResult::Denied {
            sender_id: user_id.into(),
            reason,
        }
    }
}

impl AccessGate for AllowlistGate {
    fn is_authorized(&self, user_id: &str) -> bool {
        match self.check_sender(user_id) {
            SenderCheckResult::Allowed => true,
            SenderCheckResult::Denied { sender_id, reason } => {
                tracing::debug!(%sender_id, %reason, "Access denied");
                false
            }
        }
    }
}

/// Reasons a URL is refused for fetching.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UrlRejection {
    #[error("URL must start with http:// or https://")]
    UnsupportedScheme,
    #[error("URL has no host")]
    MissingHost,
    #[error("Request to private/internal address '{0}' blocked (SSRF prevention)")]
    PrivateAddress(String),
}

/// Fetch policy for URLs the model asks tools to read.
pub struct UrlPolicy;

impl UrlPolicy {
    pub fn check(url: &str) -> Result<(), UrlRejection> {
        let host = extract_host(url)?;
        if is_private_host(&host) {
            return Err(UrlRejection::PrivateAddress(host));
        }
        Ok(())
    }
}

fn extract_host(url: &str) -> Result<String, UrlRejection> {
    let lower = url.trim().to_lowercase();
    let rest = lower
        .strip_prefix("http://")
        .or_else(|| lower.strip_prefix("https://"))
        .ok_or(UrlRejection::UnsupportedScheme)?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    // Drop userinfo
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else {
        authority.split(':').next().unwrap_or(authority)
    };

    if host.is_empty() {
        return Err(UrlRejection::MissingHost);
    }
    Ok(host.trim_end_matches('.').to_string())
}

/// Check if a host names a loopback, private, link-local or unspecified address.
fn is_private_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".internal") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => is_private_v6(ip),
        Err(_) => false,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local() // includes 169.254.169.254 cloud metadata
        || ip.is_unspecified()
        || ip.is_broadcast()
        || (ip.octets()[0] == 100 && (64..128).contains(&ip.octets()[1])) // CGNAT
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local
        || (first & 0xffc0) == 0xfe80 // link local
}
