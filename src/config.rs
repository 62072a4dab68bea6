//! Startup configuration: broker/feed session settings and the symbol whitelist.
//!
//! Both files are JSON and read exactly once before ingestion starts.
//! `account.json` is mandatory (fatal when missing or malformed); the
//! whitelist is optional — a missing or empty file means "monitor all".

use std::fs;
use std::path::Path;

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Symbol keys are fixed 32-byte NUL-padded fields in the tick stream.
pub const SYMBOL_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("whitelist root is not a JSON object: {0}")]
    WhitelistSchema(String),
}

// ============================================================
// ACCOUNT SETTINGS (account.json)
// ============================================================

/// Broker session parameters (`trading` section).
#[derive(Debug, Clone, Deserialize)]
pub struct TradingSettings {
    #[serde(rename = "sWtfs")]
    pub wtfs: String,
    #[serde(rename = "sKey")]
    pub key: String,
    #[serde(rename = "sKhh")]
    pub khh: String,
    #[serde(rename = "sPwd")]
    pub pwd: String,
    #[serde(rename = "sNode")]
    pub node: String,
}

/// Feed session parameters (`market` section).
#[derive(Debug, Clone, Deserialize)]
pub struct MarketSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Complete startup settings from `account.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub trading: TradingSettings,
    pub market: MarketSettings,
    /// Logging section is optional; sensible defaults apply when absent.
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    /// "hourly" | "daily" | anything else = single file
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: "server_logs".to_string(),
            log_file: "limitup_agent.log".to_string(),
            log_level: "info".to_string(),
            rotation: "daily".to_string(),
        }
    }
}

impl Settings {
    /// Load `account.json`. Any failure here is fatal at startup.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            return Err(ConfigError::NotFound(path.to_string()));
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

// ============================================================
// SYMBOL CLASSIFICATION
// ============================================================

/// Canonicalize a whitelist key to "NNNNNN.SH" / "NNNNNN.SZ".
///
/// Accepted inputs:
/// - 6-digit bare code: '6' prefix → SH, anything else → SZ
/// - "NNNNNN.sh" / "NNNNNN.SZ" etc.: suffix normalized to upper
///
/// Returns `None` for anything else.
pub fn classify_code(raw: &str) -> Option<String> {
    let s = raw.trim();

    if let Some(dot) = s.rfind('.') {
        let (code, suffix) = s.split_at(dot);
        let suffix = suffix[1..].to_ascii_uppercase();
        if (suffix == "SH" || suffix == "SZ")
            && code.len() == 6
            && code.bytes().all(|b| b.is_ascii_digit())
        {
            return Some(format!("{}.{}", code, suffix));
        }
        return None;
    }

    if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
        let market = if s.starts_with('6') { "SH" } else { "SZ" };
        return Some(format!("{}.{}", s, market));
    }

    None
}

/// NUL-pad a canonical symbol into the 32-byte wire key.
pub fn pad_symbol_key(symbol: &str) -> [u8; SYMBOL_KEY_LEN] {
    let mut key = [0u8; SYMBOL_KEY_LEN];
    let bytes = symbol.as_bytes();
    let n = bytes.len().min(SYMBOL_KEY_LEN);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Recover the symbol string from a padded wire key.
pub fn symbol_from_key(key: &[u8]) -> &str {
    let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
    std::str::from_utf8(&key[..end]).unwrap_or("")
}

// ============================================================
// WHITELIST
// ============================================================

/// Frozen set of watched symbols.
///
/// Built once before the feed callback is armed; read-only afterwards, so
/// producers probe it without synchronization.
#[derive(Debug, Default, Clone)]
pub struct Whitelist {
    codes: Vec<String>,
    keys: FxHashSet<[u8; SYMBOL_KEY_LEN]>,
}

impl Whitelist {
    /// Load `white_list.json`. The file holds a top-level object whose keys
    /// are symbol identifiers; the values are ignored.
    ///
    /// A missing file is not an error: the agent runs in monitor-all mode.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            warn!("whitelist file {} not found, monitoring all symbols", path);
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let doc: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        let obj = doc
            .as_object()
            .ok_or_else(|| ConfigError::WhitelistSchema(path.to_string()))?;

        let mut list = Self::default();
        for raw in obj.keys() {
            match classify_code(raw) {
                Some(symbol) => list.insert(symbol),
                None => warn!("unrecognized whitelist key, skipped: {}", raw),
            }
        }
        Ok(list)
    }

    pub fn from_codes<I: IntoIterator<Item = S>, S: AsRef<str>>(codes: I) -> Self {
        let mut list = Self::default();
        for raw in codes {
            if let Some(symbol) = classify_code(raw.as_ref()) {
                list.insert(symbol);
            }
        }
        list
    }

    fn insert(&mut self, symbol: String) {
        if self.keys.insert(pad_symbol_key(&symbol)) {
            self.codes.push(symbol);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Raw-key membership probe used on the feed hot path.
    #[inline]
    pub fn contains_key(&self, key: &[u8; SYMBOL_KEY_LEN]) -> bool {
        self.keys.contains(key)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.keys.contains(&pad_symbol_key(symbol))
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Semicolon-joined subscription list for by-code feed subscription.
    /// Empty string means subscribe market-wide.
    pub fn subscription_string(&self) -> String {
        self.codes.join(";")
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bare_codes() {
        assert_eq!(classify_code("600001").as_deref(), Some("600001.SH"));
        assert_eq!(classify_code("688001").as_deref(), Some("688001.SH"));
        assert_eq!(classify_code("000002").as_deref(), Some("000002.SZ"));
        assert_eq!(classify_code("300750").as_deref(), Some("300750.SZ"));
    }

    #[test]
    fn test_classify_suffixed_codes() {
        assert_eq!(classify_code("000002.sz").as_deref(), Some("000002.SZ"));
        assert_eq!(classify_code("600001.Sh").as_deref(), Some("600001.SH"));
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert_eq!(classify_code("60001"), None);
        assert_eq!(classify_code("6000011"), None);
        assert_eq!(classify_code("ABCDEF"), None);
        assert_eq!(classify_code("600001.XX"), None);
        assert_eq!(classify_code(""), None);
    }

    #[test]
    fn test_pad_and_recover_key() {
        let key = pad_symbol_key("600001.SH");
        assert_eq!(&key[..9], b"600001.SH");
        assert!(key[9..].iter().all(|&b| b == 0));
        assert_eq!(symbol_from_key(&key), "600001.SH");
    }

    #[test]
    fn test_whitelist_from_codes() {
        let wl = Whitelist::from_codes(["600001", "000002.sz", "junk", "600001.SH"]);
        assert_eq!(wl.len(), 2);
        assert!(wl.contains("600001.SH"));
        assert!(wl.contains("000002.SZ"));
        assert!(!wl.contains("300750.SZ"));
        assert!(wl.contains_key(&pad_symbol_key("000002.SZ")));
    }

    #[test]
    fn test_subscription_string() {
        let wl = Whitelist::from_codes(["600001", "000002"]);
        assert_eq!(wl.subscription_string(), "600001.SH;000002.SZ");
        assert_eq!(Whitelist::default().subscription_string(), "");
    }

    #[test]
    fn test_settings_parse() {
        let json = r#"{
            "trading": {"sWtfs":"9","sKey":"k","sKhh":"10001","sPwd":"p","sNode":"n1"},
            "market": {"host":"10.0.0.1","port":6001,"user":"u","password":"pw"}
        }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(s.trading.khh, "10001");
        assert_eq!(s.market.port, 6001);
        assert_eq!(s.log.rotation, "daily");
    }

    #[test]
    fn test_settings_missing_file() {
        assert!(matches!(
            Settings::load("/nonexistent/account.json"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_whitelist_missing_file_is_monitor_all() {
        let wl = Whitelist::load("/nonexistent/white_list.json").unwrap();
        assert!(wl.is_empty());
    }
}
