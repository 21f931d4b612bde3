use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;

pub(crate) const DEFAULT_APP_NAME: &str = "points-console";
pub(crate) const DEFAULT_WS_URL: &str = "ws://127.0.0.1:9944";
pub(crate) const DEFAULT_CONTRACT_ADDRESS: &str = "5FyEUCbeE69z97PUxWGQWJSo4F2p64Fpev2vBWYvPpM8r8Q9";
pub(crate) const DEFAULT_CUSTOM_TYPES: &str = r#"{"Address":"AccountId","LookupSource":"AccountId"}"#;
pub(crate) const DEFAULT_KEY_ENCRYPTION_KEY: &str = "points-console-dev-key";
pub(crate) const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub(crate) const DEFAULT_EVENT_FEED_CAPACITY: usize = 100;
pub(crate) const DEFAULT_TRACKED_CALL_CAPACITY: usize = 256;

/// Static configuration, read once at startup.
#[derive(Debug, Clone)]
pub(crate) struct ServiceConfig {
    pub(crate) app_name: String,
    pub(crate) ws_url: String,
    /// Type aliases applied when decoding chain metadata.
    pub(crate) custom_types: BTreeMap<String, String>,
    pub(crate) contract_address: String,
    /// `None` keeps accounts and contracts in memory.
    pub(crate) keystore_path: Option<String>,
    pub(crate) key_encryption_key: String,
    pub(crate) extension_url: Option<String>,
    pub(crate) listen_addr: SocketAddr,
    pub(crate) event_feed_capacity: usize,
    /// Tracked calls kept for polling before the oldest settled ones are evicted.
    pub(crate) tracked_call_capacity: usize,
    pub(crate) bringup_attempts: u32,
    pub(crate) reconnect_attempts: u32,
}

impl ServiceConfig {
    pub(crate) fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let text = |key: &str, default: &str| value(key).unwrap_or_else(|| default.to_owned());

        let custom_types: BTreeMap<String, String> = serde_json::from_str(&text("POINTS_CUSTOM_TYPES", DEFAULT_CUSTOM_TYPES))
            .context("POINTS_CUSTOM_TYPES must be a JSON object of type aliases")?;

        let listen_addr = text("POINTS_LISTEN_ADDR", DEFAULT_LISTEN_ADDR)
            .parse::<SocketAddr>()
            .context("POINTS_LISTEN_ADDR must be a socket address")?;

        let event_feed_capacity = match value("POINTS_EVENT_FEED_CAPACITY") {
            Some(raw) => raw
                .parse::<usize>()
                .context("POINTS_EVENT_FEED_CAPACITY must be a number")?,
            None => DEFAULT_EVENT_FEED_CAPACITY,
        };

        let tracked_call_capacity = match value("POINTS_TRACKED_CALL_CAPACITY") {
            Some(raw) => raw
                .parse::<usize>()
                .context("POINTS_TRACKED_CALL_CAPACITY must be a number")?,
            None => DEFAULT_TRACKED_CALL_CAPACITY,
        };

        let bringup_attempts = match value("POINTS_BRINGUP_ATTEMPTS") {
            Some(raw) => raw.parse::<u32>().context("POINTS_BRINGUP_ATTEMPTS must be a number")?,
            None => 1,
        };

        let reconnect_attempts = match value("POINTS_RECONNECT_ATTEMPTS") {
            Some(raw) => raw
                .parse::<u32>()
                .context("POINTS_RECONNECT_ATTEMPTS must be a number")?,
            None => 0,
        };

        Ok(Self {
            app_name: text("POINTS_APP_NAME", DEFAULT_APP_NAME),
            ws_url: text("POINTS_WS_URL", DEFAULT_WS_URL),
            custom_types,
            contract_address: text("POINTS_CONTRACT_ADDRESS", DEFAULT_CONTRACT_ADDRESS),
            keystore_path: value("POINTS_KEYSTORE_PATH"),
            key_encryption_key: text("POINTS_KEY_ENCRYPTION_KEY", DEFAULT_KEY_ENCRYPTION_KEY),
            extension_url: value("POINTS_EXTENSION_URL"),
            listen_addr,
            event_feed_capacity,
            tracked_call_capacity,
            bringup_attempts,
            reconnect_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() -> Result<()> {
        let config = ServiceConfig::from_lookup(lookup(&[]))?;

        assert_eq!(config.app_name, "points-console");
        assert_eq!(config.ws_url, "ws://127.0.0.1:9944");
        assert_eq!(config.contract_address, DEFAULT_CONTRACT_ADDRESS);
        assert_eq!(config.custom_types.get("Address").map(String::as_str), Some("AccountId"));
        assert_eq!(config.custom_types.get("LookupSource").map(String::as_str), Some("AccountId"));
        assert_eq!(config.keystore_path, None);
        assert_eq!(config.extension_url, None);
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.event_feed_capacity, 100);
        assert_eq!(config.tracked_call_capacity, 256);
        assert_eq!(config.bringup_attempts, 1);
        assert_eq!(config.reconnect_attempts, 0);
        Ok(())
    }

    #[test]
    fn overrides_are_read() -> Result<()> {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("POINTS_WS_URL", "ws://node:9944"),
            ("POINTS_CUSTOM_TYPES", r#"{"Balance":"u128"}"#),
            ("POINTS_KEYSTORE_PATH", "/var/lib/points"),
            ("POINTS_BRINGUP_ATTEMPTS", "3"),
            ("POINTS_EXTENSION_URL", "  "),
        ]))?;

        assert_eq!(config.ws_url, "ws://node:9944");
        assert_eq!(config.custom_types.len(), 1);
        assert_eq!(config.keystore_path.as_deref(), Some("/var/lib/points"));
        assert_eq!(config.bringup_attempts, 3);
        assert_eq!(config.extension_url, None);
        Ok(())
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(ServiceConfig::from_lookup(lookup(&[("POINTS_CUSTOM_TYPES", "[1,2]")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("POINTS_LISTEN_ADDR", "localhost")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("POINTS_BRINGUP_ATTEMPTS", "many")])).is_err());
    }
}
