use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a usable copy of an external tool was found.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", content = "location", rename_all = "snake_case")]
pub enum ToolLocation {
    Local(PathBuf),
    Global(PathBuf),
    Remote(String),
}

impl ToolLocation {
    pub fn source(&self) -> &'static str {
        match self {
            ToolLocation::Local(_) => "local",
            ToolLocation::Global(_) => "global",
            ToolLocation::Remote(_) => "remote",
        }
    }

    pub fn display(&self) -> String {
        match self {
            ToolLocation::Local(path) | ToolLocation::Global(path) => path.display().to_string(),
            ToolLocation::Remote(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolAvailabilityRecord {
    pub tool: String,
    /// `None` records a confirmed miss.
    #[serde(default)]
    pub location: Option<ToolLocation>,
    pub resolved_at_ms: u64,
    pub ttl_ms: u64,
}

impl ToolAvailabilityRecord {
    pub fn is_available(&self) -> bool {
        self.location.is_some()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.resolved_at_ms) >= self.ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_expires_after_ttl() {
        let record = ToolAvailabilityRecord {
            tool: "eslint".to_string(),
            location: None,
            resolved_at_ms: 1_000,
            ttl_ms: 500,
        };
        assert!(!record.is_expired(1_499));
        assert!(record.is_expired(1_500));
        assert!(!record.is_available());
    }

    #[test]
    fn location_serializes_with_source_tag() {
        let value =
            serde_json::to_value(ToolLocation::Remote("https://docs.example".to_string()))
                .expect("json");
        assert_eq!(value["source"], "remote");
        assert_eq!(value["location"], "https://docs.example");
    }
}
