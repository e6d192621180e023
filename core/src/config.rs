use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::policy::ListingMode;

/// CoreHandleの設定（全フィールド省略可）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub relays: Vec<String>,
    pub metadata_timeout_secs: u64,
    pub listing_mode: ListingMode,
    /// メッセージのメタデータの `app`
    pub app_name: String,
    /// メッセージのメタデータの `type`
    pub message_type: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            metadata_timeout_secs: 10,
            listing_mode: ListingMode::Strict,
            app_name: "coinstr".to_string(),
            message_type: "policy".to_string(),
        }
    }
}

impl CoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_fields() {
        let config = CoreConfig::from_json(r#"{"relays":["wss://relay.damus.io"]}"#).unwrap();
        assert_eq!(config.relays, vec!["wss://relay.damus.io".to_string()]);
        assert_eq!(config.metadata_timeout(), Duration::from_secs(10));
        assert_eq!(config.listing_mode, ListingMode::Strict);
        assert_eq!(config.app_name, "coinstr");
    }

    #[test]
    fn test_lenient_mode() {
        let config = CoreConfig::from_json(r#"{"listing_mode":"lenient","metadata_timeout_secs":3}"#).unwrap();
        assert_eq!(config.listing_mode, ListingMode::Lenient);
        assert_eq!(config.metadata_timeout_secs, 3);
    }

    #[test]
    fn test_invalid_json() {
        assert!(CoreConfig::from_json("{").is_err());
        assert!(CoreConfig::from_json(r#"{"listing_mode":"sometimes"}"#).is_err());
    }
}
