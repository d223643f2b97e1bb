use crate::error::{MarketError, Result};
use crate::model::Policy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
    pub busy_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ProtocolConfig {
    pub proof_freshness_seconds: u64,
    pub max_clock_skew_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SettlementProviderKind {
    Mock,
    Http,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct SettlementConfig {
    pub provider: SettlementProviderKind,
    pub endpoint: Option<String>,
    pub webhook_secret: Option<String>,
    pub source_chain: String,
    pub timeout_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub reconcile_min_age_seconds: u64,
    pub abandon_after_seconds: u64,
    /// Mock provider only: delay before it reports finality.
    pub mock_finality_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct WalletConfig {
    /// Hex-encoded 32-byte seed that wallet keys are derived from.
    pub master_seed: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://agentmarket.db".to_string(),
            max_connections: Some(10),
            acquire_timeout_seconds: Some(30),
            busy_timeout_seconds: Some(5),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            proof_freshness_seconds: 600,
            max_clock_skew_seconds: 60,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            provider: SettlementProviderKind::Mock,
            endpoint: None,
            webhook_secret: None,
            source_chain: "base-sepolia".to_string(),
            timeout_seconds: 30,
            reconcile_interval_seconds: 60,
            reconcile_min_age_seconds: 120,
            abandon_after_seconds: 3600,
            mock_finality_seconds: Some(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl ProtocolConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.proof_freshness_seconds)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_seconds)
    }
}

impl SettlementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }
}

impl LoggingConfig {
    /// Installs the global tracing subscriber. `RUST_LOG` wins over the
    /// configured level.
    pub fn init_tracing(&self) {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        let registry = tracing_subscriber::registry().with(filter);

        match self.format.as_deref() {
            Some("json") => registry.with(fmt::layer().json()).init(),
            _ => registry.with(fmt::layer()).init(),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| MarketError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| MarketError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Loads the file if it exists, falling back to defaults, then applies
    /// environment overrides.
    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        if let Ok(endpoint) = std::env::var("SETTLEMENT_ENDPOINT") {
            config.settlement.endpoint = Some(endpoint);
            config.settlement.provider = SettlementProviderKind::Http;
        }

        if let Ok(secret) = std::env::var("SETTLEMENT_WEBHOOK_SECRET") {
            config.settlement.webhook_secret = Some(secret);
        }

        if let Ok(seed) = std::env::var("WALLET_MASTER_SEED") {
            config.wallet.master_seed = Some(seed);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MarketError::Config("Server port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(MarketError::Config("Database URL cannot be empty".to_string()));
        }

        if self.protocol.proof_freshness_seconds == 0 {
            return Err(MarketError::Config("Proof freshness window cannot be 0".to_string()));
        }

        if self.settlement.provider == SettlementProviderKind::Http && self.settlement.endpoint.is_none() {
            return Err(MarketError::Config(
                "HTTP settlement provider requires an endpoint".to_string(),
            ));
        }

        let has_secret = self.settlement.webhook_secret.as_deref().is_some_and(|s| !s.is_empty());
        if self.settlement.provider == SettlementProviderKind::Http && !has_secret {
            return Err(MarketError::Config(
                "HTTP settlement provider requires a webhook secret".to_string(),
            ));
        }

        if self.settlement.timeout_seconds == 0 {
            return Err(MarketError::Config("Settlement timeout cannot be 0".to_string()));
        }

        if self.settlement.abandon_after_seconds < self.settlement.reconcile_min_age_seconds {
            return Err(MarketError::Config(
                "abandon_after_seconds must be at least reconcile_min_age_seconds".to_string(),
            ));
        }

        self.policy
            .validate()
            .map_err(|e| MarketError::Config(format!("Invalid default policy: {}", e)))?;

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| MarketError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| MarketError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
