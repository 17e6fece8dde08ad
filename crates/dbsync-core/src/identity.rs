use serde::{Deserialize, Serialize};
use tracing::warn;

/// Who is acting, and from where.
///
/// Owner and hostname end up inside `.`-separated lock marker names, so both
/// are sanitized on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner: String,
    pub hostname: String,
    pub platform: String,
    pub tool_version: String,
}

impl Identity {
    pub fn new(owner: &str, hostname: &str) -> Self {
        Self {
            owner: sanitize_segment(owner),
            hostname: short_hostname(hostname),
            platform: std::env::consts::OS.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Detect the current user and host, optionally overriding the owner.
    pub fn detect(owner_override: Option<&str>) -> Self {
        let hostname = whoami::fallible::hostname().unwrap_or_else(|e| {
            warn!("Failed to detect hostname, using 'unknown-host': {}", e);
            "unknown-host".to_string()
        });
        let owner = match owner_override {
            Some(owner) => owner.to_string(),
            None => whoami::username(),
        };
        Self::new(&owner, &hostname)
    }

    /// `owner@host`, as shown in lock messages.
    pub fn display_name(&self) -> String {
        format!("{}@{}", self.owner, self.hostname)
    }
}

fn short_hostname(hostname: &str) -> String {
    let first = hostname.split('.').next().unwrap_or_default();
    sanitize_segment(first)
}

fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '/' | '\\' | ' ' => '-',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitizes_marker_segments() {
        let id = Identity::new("jane.doe", "build01.corp.example.com");
        assert_eq!(id.owner, "jane-doe");
        assert_eq!(id.hostname, "build01");
        assert_eq!(id.display_name(), "jane-doe@build01");
    }

    #[test]
    fn test_empty_values_fall_back() {
        let id = Identity::new("  ", "");
        assert_eq!(id.owner, "unknown");
        assert_eq!(id.hostname, "unknown");
    }

    #[test]
    fn test_detect_with_override() {
        let id = Identity::detect(Some("ci-bot"));
        assert_eq!(id.owner, "ci-bot");
        assert!(!id.hostname.contains('.'));
        assert_eq!(id.platform, std::env::consts::OS);
    }
}
