//! `memcard.toml` loading.
//!
//! ```toml
//! [auth]
//! key_left = "00112233445566778899AABBCCDDEEFF"
//! iv_left = "0011223344556677"
//! key_right = "..."
//! iv_right = "..."
//! challenge_iv = "..."
//! timeout_ms = 5000
//! retries = 5
//!
//! [io]
//! verify_writes = true
//! erase_before_write = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthKeys;
use crate::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "memcard.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_iv: Option<String>,
    #[serde(default = "AuthConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "AuthConfig::default_retries")]
    pub retries: u32,
}

/// Transport identification of the bridging adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(default = "DeviceConfig::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "DeviceConfig::default_product_id")]
    pub product_id: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IoConfig {
    #[serde(default = "IoConfig::default_true")]
    pub verify_writes: bool,
    #[serde(default = "IoConfig::default_true")]
    pub erase_before_write: bool,
    /// Overrides the spare length implied by the card flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spare_len: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
}

impl AuthConfig {
    fn default_timeout_ms() -> u64 {
        5_000
    }

    fn default_retries() -> u32 {
        5
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keys(&self) -> Result<AuthKeys> {
        Ok(AuthKeys {
            key_left: parse_hex(required(&self.key_left, "auth.key_left")?, "auth.key_left")?,
            iv_left: parse_hex(required(&self.iv_left, "auth.iv_left")?, "auth.iv_left")?,
            key_right: parse_hex(
                required(&self.key_right, "auth.key_right")?,
                "auth.key_right",
            )?,
            iv_right: parse_hex(required(&self.iv_right, "auth.iv_right")?, "auth.iv_right")?,
            challenge_iv: parse_hex(
                required(&self.challenge_iv, "auth.challenge_iv")?,
                "auth.challenge_iv",
            )?,
        })
    }

    pub fn set_keys(&mut self, keys: &AuthKeys) {
        self.key_left = Some(to_hex(&keys.key_left));
        self.iv_left = Some(to_hex(&keys.iv_left));
        self.key_right = Some(to_hex(&keys.key_right));
        self.iv_right = Some(to_hex(&keys.iv_right));
        self.challenge_iv = Some(to_hex(&keys.challenge_iv));
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key_left: None,
            iv_left: None,
            key_right: None,
            iv_right: None,
            challenge_iv: None,
            timeout_ms: Self::default_timeout_ms(),
            retries: Self::default_retries(),
        }
    }
}

impl DeviceConfig {
    fn default_vendor_id() -> u16 {
        0x054C
    }

    fn default_product_id() -> u16 {
        0x02EA
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
        }
    }
}

impl IoConfig {
    fn default_true() -> bool {
        true
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            verify_writes: true,
            erase_before_write: true,
            spare_len: None,
        }
    }
}

impl LogConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    pub fn level_filter(&self) -> Result<log::LevelFilter> {
        self.level
            .parse()
            .map_err(|_| Error::Config(format!("unknown log level {:?}", self.level)))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Loads `path`, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| Error::Config(format!("{field} is not configured")))
}

fn parse_hex<const N: usize>(value: &str, field: &str) -> Result<[u8; N]> {
    let digits: Vec<u8> = value
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() != N * 2 {
        return Err(Error::Config(format!(
            "{field} must be {} hex digits, got {}",
            N * 2,
            digits.len()
        )));
    }

    let mut out = [0u8; N];
    for (byte, pair) in out.iter_mut().zip(digits.chunks(2)) {
        let text = std::str::from_utf8(pair).map_err(|e| Error::Config(e.to_string()))?;
        *byte = u8::from_str_radix(text, 16)
            .map_err(|_| Error::Config(format!("{field} contains non-hex digits {text:?}")))?;
    }
    Ok(out)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml_str("").expect("parse empty config");
        assert!(config.io.verify_writes);
        assert!(config.io.erase_before_write);
        assert_eq!(config.auth.retries, 5);
        assert_eq!(config.device.vendor_id, 0x054C);
        assert_eq!(config.device.product_id, 0x02EA);
        assert!(matches!(config.auth.keys(), Err(Error::Config(_))));
    }

    #[test]
    fn keys_parse_from_hex() {
        let config = Config::from_toml_str(
            r#"
            [auth]
            key_left = "000102030405060708090A0B0C0D0E0F"
            iv_left = "1011121314151617"
            key_right = "202122232425262728292A2B2C2D2E2F"
            iv_right = "3031323334353637"
            challenge_iv = "4041424344454647"
            "#,
        )
        .expect("parse config");
        let keys = config.auth.keys().expect("keys");
        assert_eq!(keys.key_left[15], 0x0F);
        assert_eq!(keys.iv_right, [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37]);
    }

    #[test]
    fn short_key_is_rejected() {
        let config = Config::from_toml_str(
            r#"
            [auth]
            key_left = "0001"
            "#,
        )
        .expect("parse config");
        assert!(matches!(config.auth.keys(), Err(Error::Config(_))));
    }

    #[test]
    fn keys_survive_a_toml_round_trip() {
        let keys = AuthKeys {
            key_left: [0xAB; 16],
            iv_left: [0x01; 8],
            key_right: [0xCD; 16],
            iv_right: [0x02; 8],
            challenge_iv: [0x03; 8],
        };
        let mut config = Config::default();
        config.auth.set_keys(&keys);
        let text = config.to_toml_string().expect("serialize");
        let reparsed = Config::from_toml_str(&text).expect("reparse");
        assert_eq!(reparsed.auth.keys().expect("keys"), keys);
    }
}
