use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::exchange::Exchange;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchanges: ExchangesConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

/// One block per supported exchange. Disabled blocks may omit credentials.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExchangesConfig {
    #[serde(default)]
    pub binance: ExchangeSettings,
    #[serde(default)]
    pub mexc: ExchangeSettings,
    #[serde(default)]
    pub kucoin: ExchangeSettings,
    #[serde(default)]
    pub kraken: ExchangeSettings,
}

impl ExchangesConfig {
    pub fn get(&self, exchange: Exchange) -> &ExchangeSettings {
        match exchange {
            Exchange::Binance => &self.binance,
            Exchange::Mexc => &self.mexc,
            Exchange::Kucoin => &self.kucoin,
            Exchange::Kraken => &self.kraken,
        }
    }

    /// Exchanges with `enabled = true`, in fixed declaration order.
    pub fn enabled(&self) -> Vec<Exchange> {
        Exchange::ALL
            .iter()
            .copied()
            .filter(|e| self.get(*e).enabled)
            .collect()
    }
}

/// Per-exchange strategy parameters and credentials.
///
/// Offsets are absolute USDC amounts; deviations are percentages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    /// KuCoin only
    #[serde(default)]
    pub api_passphrase: Option<String>,
    /// REST base URL override (defaults per exchange)
    #[serde(default)]
    pub base_url: Option<String>,
    /// USDC below current price for new buy orders
    #[serde(default = "default_buy_offset")]
    pub buy_offset: Decimal,
    /// USDC above the buy price for the paired sell order
    #[serde(default = "default_sell_offset")]
    pub sell_offset: Decimal,
    /// Percent of free USDC committed per new cycle
    #[serde(default = "default_percent")]
    pub percent: Decimal,
    /// Cancel unfilled buys older than this many days (0 disables)
    #[serde(default)]
    pub buy_max_days: u32,
    /// Cancel unfilled buys when price rises this percent above the
    /// buy price (0 disables)
    #[serde(default)]
    pub buy_max_price_deviation: Decimal,
    /// Enable the accumulation policy for pending sells
    #[serde(default)]
    pub accumulation: bool,
    /// Percent below the target sell price before accumulation is
    /// considered
    #[serde(default = "default_sell_accu_deviation")]
    pub sell_accu_price_deviation: Decimal,
    /// Use maker-adjusted pricing for order placement
    #[serde(default)]
    pub adaptive_order: bool,
    /// Guard ratio for locked-balance reconciliation: when the native
    /// locked figure is below derived-from-open-orders x ratio, the
    /// derived figure wins
    #[serde(default = "default_min_locked_ratio")]
    pub min_locked_ratio: Decimal,
    /// Fallback fee rate (fraction, e.g. 0.001 = 0.1%) used when real
    /// fees cannot be read from trade history. Defaults per exchange
    /// are applied in the factory when unset.
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_secret: None,
            api_passphrase: None,
            base_url: None,
            buy_offset: default_buy_offset(),
            sell_offset: default_sell_offset(),
            percent: default_percent(),
            buy_max_days: 0,
            buy_max_price_deviation: Decimal::ZERO,
            accumulation: false,
            sell_accu_price_deviation: default_sell_accu_deviation(),
            adaptive_order: false,
            min_locked_ratio: default_min_locked_ratio(),
            fee_rate: None,
        }
    }
}

fn default_buy_offset() -> Decimal {
    dec!(200)
}

fn default_sell_offset() -> Decimal {
    dec!(500)
}

fn default_percent() -> Decimal {
    dec!(10)
}

fn default_sell_accu_deviation() -> Decimal {
    dec!(3)
}

fn default_min_locked_ratio() -> Decimal {
    dec!(0.9)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Task persistence file path
    #[serde(default = "default_tasks_file")]
    pub tasks_file: String,
    /// Default interval for bootstrapped update tasks (minutes)
    #[serde(default = "default_update_interval_min")]
    pub update_interval_minutes: u32,
    /// Daily HH:MM for the bootstrapped new-cycle task
    #[serde(default = "default_new_cycle_time")]
    pub new_cycle_time: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tasks_file: default_tasks_file(),
            update_interval_minutes: default_update_interval_min(),
            new_cycle_time: default_new_cycle_time(),
        }
    }
}

fn default_tasks_file() -> String {
    "data/tasks.conf".to_string()
}

fn default_update_interval_min() -> u32 {
    30
}

fn default_new_cycle_time() -> String {
    "09:00".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the JSON document collections
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DryRunConfig {
    /// Enable dry run mode (no real orders)
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Optional log file directory; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from `config/default.toml`, an optional
    /// `config/local.toml` overlay, and `CYCLER_*` environment
    /// variables (e.g. `CYCLER_EXCHANGES__BINANCE__API_KEY`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from(dir: &str) -> Result<Self, ConfigError> {
        let base = Path::new(dir);
        let cfg = Config::builder()
            .add_source(File::from(base.join("default")).required(false))
            .add_source(File::from(base.join("local")).required(false))
            .add_source(Environment::with_prefix("CYCLER").separator("__"))
            .build()?;

        let app: AppConfig = cfg.try_deserialize()?;
        app.validate().map_err(ConfigError::Message)?;
        Ok(app)
    }

    /// Startup validation. Invalid configuration is fatal (the process
    /// must not trade on an unknown state).
    pub fn validate(&self) -> Result<(), String> {
        for exchange in Exchange::ALL {
            let s = self.exchanges.get(exchange);
            if !s.enabled {
                continue;
            }
            if !self.dry_run.enabled {
                if s.api_key.as_deref().unwrap_or("").is_empty() {
                    return Err(format!("{exchange}: api_key is required"));
                }
                if s.api_secret.as_deref().unwrap_or("").is_empty() {
                    return Err(format!("{exchange}: api_secret is required"));
                }
                if exchange == Exchange::Kucoin
                    && s.api_passphrase.as_deref().unwrap_or("").is_empty()
                {
                    return Err("kucoin: api_passphrase is required".to_string());
                }
            }
            if s.percent <= Decimal::ZERO || s.percent > Decimal::from(100) {
                return Err(format!("{exchange}: percent must be in (0, 100]"));
            }
            if s.buy_offset < Decimal::ZERO || s.sell_offset < Decimal::ZERO {
                return Err(format!("{exchange}: offsets must be non-negative"));
            }
            if s.buy_max_price_deviation < Decimal::ZERO {
                return Err(format!(
                    "{exchange}: buy_max_price_deviation must be non-negative"
                ));
            }
            if s.sell_accu_price_deviation < Decimal::ZERO {
                return Err(format!(
                    "{exchange}: sell_accu_price_deviation must be non-negative"
                ));
            }
            if let Some(rate) = s.fee_rate {
                if rate < Decimal::ZERO || rate >= Decimal::ONE {
                    return Err(format!("{exchange}: fee_rate must be in [0, 1)"));
                }
            }
        }
        crate::domain::parse_specific_time(&self.scheduler.new_cycle_time)
            .map_err(|e| format!("scheduler.new_cycle_time: {e}"))?;
        Ok(())
    }
}
