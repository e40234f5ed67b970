use std::env;
use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anchor::AnchorPriority;
use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub anchor: AnchorConfig,
    pub certificates: CertificateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub batch_limit: u32,
    pub priority: AnchorPriority,
    pub default_chain: String,
    /// Chains to register providers for
    pub chains: Vec<String>,
    /// Register simulated chains in place of real RPC clients. Local runs only;
    /// simulated anchors are not publicly verifiable.
    pub simulate_chains: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Refuse to issue a certificate for a record hash the ledger does not hold
    pub require_existing_record: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://transparency.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            anchor: AnchorConfig::default(),
            certificates: CertificateConfig::default(),
        }
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            batch_limit: 100,
            priority: AnchorPriority::Balanced,
            default_chain: "polygon".to_string(),
            chains: vec![
                "polygon".to_string(),
                "ethereum".to_string(),
                "arbitrum".to_string(),
            ],
            simulate_chains: false,
            timeout_secs: 30,
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            require_existing_record: true,
        }
    }
}

impl AppConfig {
    /// Defaults, then `TRANSPARENCY_CONFIG` (or `transparency.toml`) if present,
    /// then `TRANSPARENCY_*` environment variables
    pub fn load() -> Result<Self> {
        let path = env::var("TRANSPARENCY_CONFIG")
            .unwrap_or_else(|_| "transparency.toml".to_string());
        Self::load_from(Some(Path::new(&path)))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        if let Some(path) = path {
            if path.exists() {
                info!("Loading configuration from {}", path.display());
            }
            builder = builder.add_source(File::from(path).required(false));
        }

        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix("TRANSPARENCY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::ConfigError("database_url is empty".to_string()));
        }

        let anchor = &self.anchor;
        if anchor.batch_limit == 0 {
            return Err(LedgerError::ConfigError(
                "anchor.batch_limit must be at least 1".to_string(),
            ));
        }
        if anchor.interval_secs == 0 {
            return Err(LedgerError::ConfigError(
                "anchor.interval_secs must be at least 1".to_string(),
            ));
        }
        if anchor.timeout_secs == 0 {
            return Err(LedgerError::ConfigError(
                "anchor.timeout_secs must be at least 1".to_string(),
            ));
        }
        if anchor.base_backoff_ms > anchor.max_backoff_ms {
            return Err(LedgerError::ConfigError(format!(
                "anchor.base_backoff_ms ({}) > anchor.max_backoff_ms ({})",
                anchor.base_backoff_ms, anchor.max_backoff_ms
            )));
        }
        if anchor.enabled && anchor.chains.is_empty() {
            return Err(LedgerError::ConfigError(
                "anchoring is enabled but no chains are configured".to_string(),
            ));
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Effective configuration in the same TOML layout `load_from` reads
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LedgerError::SerializationError(format!("TOML serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.anchor.priority, AnchorPriority::Balanced);
        assert!(config.certificates.require_existing_record);
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("transparency.toml");
        fs::write(
            &path,
            r#"
server_port = 8088

[anchor]
batch_limit = 25
priority = "security"
default_chain = "ethereum"
simulate_chains = true

[certificates]
require_existing_record = false
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.server_port, 8088);
        assert_eq!(config.anchor.batch_limit, 25);
        assert_eq!(config.anchor.priority, AnchorPriority::Security);
        assert_eq!(config.anchor.default_chain, "ethereum");
        assert_eq!(config.anchor.max_retries, 3);
        assert!(config.anchor.simulate_chains);
        assert!(!config.certificates.require_existing_record);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("absent.toml");
        let config = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.anchor.batch_limit, 100);
        assert!(!config.anchor.simulate_chains);
    }

    #[test]
    fn test_printed_config_loads_back() {
        let mut config = AppConfig::default();
        config.anchor.priority = AnchorPriority::Speed;
        config.anchor.chains = vec!["arbitrum".to_string()];

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("printed.toml");
        fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.anchor.priority, AnchorPriority::Speed);
        assert_eq!(loaded.anchor.chains, vec!["arbitrum".to_string()]);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.toml");
        fs::write(&path, "[anchor]\nbatch_limit = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(Some(&path)),
            Err(LedgerError::ConfigError(_))
        ));

        fs::write(&path, "[anchor]\npriority = \"cheapest\"\n").unwrap();
        assert!(AppConfig::load_from(Some(&path)).is_err());
    }
}
