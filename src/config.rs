//! Session settings, loadable from YAML.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HELLO_RETRIES, DEFAULT_RECORD_LEN, DEFAULT_SOURCE_ADDRESS, DEFAULT_TARGET_ADDRESS,
    POST_SEND_DELAY_US, SEND_TIMEOUT_MS,
};
use crate::error::{Error, Result};

/// Pipe addresses are 40 bits wide.
pub const PIPE_ADDRESS_MASK: u64 = 0xff_ffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(deserialize_with = "parse_pipe_address")]
    pub source: u64,
    #[serde(deserialize_with = "parse_pipe_address")]
    pub target: u64,
    pub hello_retries: u8,
    pub send_timeout_ms: u64,
    pub post_send_delay_us: u64,
    pub record_len: usize,
    pub progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            source: DEFAULT_SOURCE_ADDRESS,
            target: DEFAULT_TARGET_ADDRESS,
            hello_retries: DEFAULT_HELLO_RETRIES,
            send_timeout_ms: SEND_TIMEOUT_MS,
            post_send_delay_us: POST_SEND_DELAY_US,
            record_len: DEFAULT_RECORD_LEN,
            progress: true,
        }
    }
}

impl SessionConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: SessionConfig = serde_yaml::from_str(text)?;
        if config.hello_retries == 0 {
            return Err(Error::Config("hello_retries must be at least 1".into()));
        }
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loading session config from {}", path.as_ref().display());
        Self::from_yaml(&text)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn post_send_delay(&self) -> Duration {
        Duration::from_micros(self.post_send_delay_us)
    }

    /// Data bytes per serialized record, clamped to what one record can hold.
    pub fn record_len(&self) -> usize {
        self.record_len.clamp(1, 255)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PipeAddress {
    Number(u64),
    Text(String),
}

fn parse_pipe_address<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let address = match PipeAddress::deserialize(deserializer)? {
        PipeAddress::Number(n) => n,
        PipeAddress::Text(s) => {
            let digits = s
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X")
                .replace('_', "");
            u64::from_str_radix(&digits, 16).map_err(|_| {
                serde::de::Error::custom(format!("invalid pipe address {:?}", s))
            })?
        }
    };
    if address & !PIPE_ADDRESS_MASK != 0 {
        return Err(serde::de::Error::custom(format!(
            "pipe address 0x{:x} is wider than 40 bits",
            address
        )));
    }
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = SessionConfig::from_yaml("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.source, 0xc0_ffee_1000);
        assert_eq!(config.target, 0xc0_ffee_0010);
        assert_eq!(config.hello_retries, 10);
        assert_eq!(config.send_timeout(), Duration::from_millis(500));
        assert_eq!(config.post_send_delay(), Duration::from_millis(10));
    }

    #[test]
    fn partial_override() {
        let config = SessionConfig::from_yaml(
            "
source: \"0xE7E7E7E7E7\"
target: 0x0102030405
hello_retries: 3
progress: false
",
        )
        .unwrap();
        assert_eq!(config.source, 0xe7_e7e7_e7e7);
        assert_eq!(config.target, 0x01_0203_0405);
        assert_eq!(config.hello_retries, 3);
        assert!(!config.progress);
        assert_eq!(config.record_len, DEFAULT_RECORD_LEN);
    }

    #[test]
    fn record_len_is_clamped() {
        let mut config = SessionConfig::default();
        config.record_len = 0;
        assert_eq!(config.record_len(), 1);
        config.record_len = 1000;
        assert_eq!(config.record_len(), 255);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            SessionConfig::from_yaml("source: \"0x1122334455667\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_yaml("target: \"nope\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_yaml("hello_retries: 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_yaml("retries: 4"),
            Err(Error::Config(_))
        ));
    }
}
