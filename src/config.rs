// =============================================================================
// Process configuration — the little the core reads from the environment
// =============================================================================
//
//   AURORA_ENCRYPTION_KEY   hex-encoded 32-byte vault key (required)
//   AURORA_ALLOWED_ORIGINS  comma-separated origin whitelist ("*" = all)
//   AURORA_BIND_ADDR        API/WebSocket bind address
//
// A missing or wrong-length key is fatal by design: starting without the
// vault would leave credentials unreadable and silently park every venue.
// =============================================================================

use anyhow::{bail, Context, Result};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";

/// Everything the process needs from its environment.
#[derive(Clone)]
pub struct AppConfig {
    pub encryption_key: [u8; 32],
    pub allowed_origins: String,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let key_hex = std::env::var("AURORA_ENCRYPTION_KEY")
            .context("AURORA_ENCRYPTION_KEY is required (hex, 32 bytes)")?;
        let allowed_origins = std::env::var("AURORA_ALLOWED_ORIGINS").unwrap_or_default();
        let bind_addr =
            std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());

        Self::build(&key_hex, allowed_origins, bind_addr)
    }

    fn build(key_hex: &str, allowed_origins: String, bind_addr: String) -> Result<Self> {
        let raw = hex::decode(key_hex.trim())
            .context("AURORA_ENCRYPTION_KEY is not valid hex")?;
        if raw.len() != 32 {
            bail!(
                "AURORA_ENCRYPTION_KEY must decode to 32 bytes, got {}",
                raw.len()
            );
        }
        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&raw);

        Ok(Self {
            encryption_key,
            allowed_origins,
            bind_addr,
        })
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("encryption_key", &"<redacted>")
            .field("allowed_origins", &self.allowed_origins)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_key_parses() {
        let key_hex = "11".repeat(32);
        let cfg = AppConfig::build(&key_hex, "*".into(), "127.0.0.1:0".into()).unwrap();
        assert_eq!(cfg.encryption_key, [0x11u8; 32]);
    }

    #[test]
    fn short_key_is_fatal() {
        assert!(AppConfig::build("aabb", String::new(), String::new()).is_err());
    }

    #[test]
    fn non_hex_key_is_fatal() {
        assert!(AppConfig::build("zz".repeat(32).as_str(), String::new(), String::new()).is_err());
    }
}
