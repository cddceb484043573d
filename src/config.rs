use clap::Parser;
use ethers::types::{Address, U256};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{PaymentRequirement, SCHEME_EXACT};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    // Ledger the payments land on
    pub ledger_rpc_url: String,
    pub chain_id: u64,
    pub network: String,
    pub payment_asset: Address,
    pub pay_to: Address,

    // Pricing
    pub price: String,
    pub max_timeout_seconds: u64,

    // Replay protection
    pub replay_ttl: Duration,
    pub redis_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            host: or("HOST", "0.0.0.0"),
            port: parse_number("PORT", &or("PORT", "8080"))?,

            ledger_rpc_url: var("LEDGER_RPC_URL").ok_or(ConfigError::Missing("LEDGER_RPC_URL"))?,
            chain_id: parse_number("CHAIN_ID", &or("CHAIN_ID", "84532"))?,
            network: or("PAYMENT_NETWORK", "base-sepolia"),
            payment_asset: parse_address(
                "PAYMENT_ASSET",
                &var("PAYMENT_ASSET").ok_or(ConfigError::Missing("PAYMENT_ASSET"))?,
            )?,
            pay_to: parse_address("PAY_TO", &var("PAY_TO").ok_or(ConfigError::Missing("PAY_TO"))?)?,

            price: or("PRICE", "100"),
            max_timeout_seconds: parse_number("MAX_TIMEOUT_SECONDS", &or("MAX_TIMEOUT_SECONDS", "60"))?,

            replay_ttl: Duration::from_secs(parse_number(
                "REPLAY_TTL_SECONDS",
                &or("REPLAY_TTL_SECONDS", "3600"),
            )?),
            redis_url: var("REDIS_URL").filter(|url| !url.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_http_url(&self.ledger_rpc_url) {
            return Err(ConfigError::Invalid {
                field: "LEDGER_RPC_URL",
                reason: "must be an HTTP(S) URL".to_string(),
            });
        }
        if U256::from_dec_str(&self.price).is_err() {
            return Err(ConfigError::Invalid {
                field: "PRICE",
                reason: format!("{} is not an integer amount of base units", self.price),
            });
        }

        let replay_store = if self.redis_url.is_some() { "redis" } else { "memory" };
        tracing::info!(
            network = %self.network,
            price = %self.price,
            replay_store,
            "Configuration validated"
        );
        Ok(())
    }

    /// The requirement every protected route advertises.
    pub fn requirement(&self) -> PaymentRequirement {
        PaymentRequirement {
            scheme: SCHEME_EXACT.to_string(),
            network: self.network.clone(),
            asset: self.payment_asset,
            amount: self.price.clone(),
            pay_to: self.pay_to,
            max_timeout_seconds: self.max_timeout_seconds,
            extra: None,
        }
    }
}

/// Load simulator options. Every flag can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "paygate-sim", version, about = "Drive a pay-per-request API with a pool of paying agents")]
pub struct SimulatorConfig {
    /// Number of simulated agents
    #[arg(long, env = "SIM_AGENTS", default_value_t = 10)]
    pub agents: usize,

    /// Target aggregate requests per second across the pool
    #[arg(long, env = "SIM_RPS", default_value_t = 10)]
    pub rps: u32,

    /// Base units of the payment asset sent to each agent
    #[arg(long, env = "SIM_FUNDING_AMOUNT", default_value = "1000000")]
    pub funding_amount: String,

    /// Native coin, in ether, sent to each agent to pay for gas. 0 skips it
    #[arg(long, env = "SIM_GAS_FUNDING", default_value = "0.001")]
    pub gas_funding: String,

    #[arg(long, env = "SIM_SERVER_URL", default_value = "http://localhost:8080")]
    pub server_url: String,

    #[arg(long, env = "LEDGER_RPC_URL", default_value = "http://localhost:8545")]
    pub ledger_url: String,

    /// 0x-prefixed private key of the account that funds the agents
    #[arg(long, env = "FUNDING_PRIVATE_KEY", hide_env_values = true)]
    pub funding_key: Option<String>,

    #[arg(long, env = "CHAIN_ID", default_value_t = 84532)]
    pub chain_id: u64,

    /// Concurrent request loops per agent
    #[arg(long, env = "SIM_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Candidate payment-asset addresses, tried in order
    #[arg(long = "asset", env = "SIM_ASSETS", value_delimiter = ',')]
    pub assets: Vec<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, env = "SIM_DURATION_SECS")]
    pub duration_secs: Option<u64>,

    #[arg(long, env = "SIM_PAYMENT_TIMEOUT_SECS", default_value_t = 30)]
    pub payment_timeout_secs: u64,
}

impl SimulatorConfig {
    /// Checks every option and reports all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !(1..=5000).contains(&self.agents) {
            errors.push(format!("agents must be between 1 and 5000 (got {})", self.agents));
        }
        if !(1..=10_000).contains(&self.rps) {
            errors.push(format!("rps must be between 1 and 10000 (got {})", self.rps));
        }
        match U256::from_dec_str(self.funding_amount.trim()) {
            Ok(amount) if !amount.is_zero() => {}
            _ => errors.push(format!(
                "funding amount must be a positive integer (got {:?})",
                self.funding_amount
            )),
        }
        if ethers::utils::parse_ether(self.gas_funding.trim()).is_err() {
            errors.push(format!(
                "gas funding must be an ether amount (got {:?})",
                self.gas_funding
            ));
        }
        if !is_http_url(&self.server_url) {
            errors.push(format!("server url is not an http(s) URL: {}", self.server_url));
        }
        if !is_http_url(&self.ledger_url) {
            errors.push(format!("ledger url is not an http(s) URL: {}", self.ledger_url));
        }
        match self.funding_key.as_deref() {
            None => errors.push("funding key is required".to_string()),
            Some(key) if !is_prefixed_hex(key) => {
                errors.push("funding key must be 0x-prefixed hex".to_string())
            }
            Some(_) => {}
        }
        if self.workers == 0 {
            errors.push("workers must be at least 1".to_string());
        }
        for asset in &self.assets {
            if Address::from_str(asset).is_err() {
                errors.push(format!("asset is not an address: {}", asset));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn funding_amount_units(&self) -> U256 {
        U256::from_dec_str(self.funding_amount.trim()).unwrap_or_default()
    }

    pub fn gas_funding_wei(&self) -> U256 {
        ethers::utils::parse_ether(self.gas_funding.trim()).unwrap_or_default()
    }

    pub fn asset_candidates(&self) -> Vec<Address> {
        self.assets
            .iter()
            .filter_map(|a| Address::from_str(a).ok())
            .collect()
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }
}

fn parse_number<T: FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{} is not a number", raw),
    })
}

fn parse_address(field: &'static str, raw: &str) -> Result<Address, ConfigError> {
    Address::from_str(raw.trim()).map_err(|e| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

fn is_http_url(raw: &str) -> bool {
    match reqwest::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host().is_some(),
        Err(_) => false,
    }
}

fn is_prefixed_hex(raw: &str) -> bool {
    raw.strip_prefix("0x")
        .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
