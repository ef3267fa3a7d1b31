//! Run configuration.
//!
//! Everything a run needs besides the catalog: where the database lives, the epoch
//! series start from, the calendar exchange, provider credentials and throttling,
//! indicator parameters, and per-table worker/delay overrides. Loaded from TOML;
//! every field has a default, and `DATABASE_URL` / `MARKET_SYNC_EPOCH` override the
//! file.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail, ensure};
use chrono_tz::Tz;
use indexmap::IndexMap;
use market_data_ingestor::models::trade_date::TradeDate;
use serde::{Deserialize, Serialize};
use shared_utils::env::parse_env_var;

use crate::{
    catalog::{Catalog, TableOverride, default_catalog, load_catalog_path},
    tz::parse_tz,
};

/// Environment variable overriding [`SyncConfig::database_url`].
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// Environment variable overriding [`SyncConfig::epoch`].
pub const EPOCH_ENV: &str = "MARKET_SYNC_EPOCH";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub database_url: String,
    /// First date fetched for an instrument with no stored rows.
    pub epoch: TradeDate,
    /// Catalog file; the built-in catalog when absent.
    pub catalog: Option<PathBuf>,
    pub calendar: CalendarSettings,
    pub provider: ProviderSettings,
    pub macd: MacdSettings,
    pub moving_average: MovingAverageSettings,
    /// Per-table overrides of worker counts and delays.
    pub tables: IndexMap<String, TableOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalendarSettings {
    pub exchange: String,
    /// IANA zone deciding what "today" is.
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSettings {
    /// Name of the variable holding the API token.
    pub token_env: String,
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MacdSettings {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MovingAverageSettings {
    pub windows: Vec<usize>,
    /// Also average volume (`ma_v_<n>` columns).
    pub volume: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "market.db".to_string(),
            epoch: TradeDate::new(chrono::NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default()),
            catalog: None,
            calendar: CalendarSettings::default(),
            provider: ProviderSettings::default(),
            macd: MacdSettings::default(),
            moving_average: MovingAverageSettings::default(),
            tables: IndexMap::new(),
        }
    }
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            exchange: "SSE".to_string(),
            timezone: "Asia/Shanghai".to_string(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            token_env: "TUSHARE_TOKEN".to_string(),
            requests_per_minute: 200,
        }
    }
}

impl Default for MacdSettings {
    fn default() -> Self {
        Self {
            fast: 12,
            slow: 26,
            signal: 9,
        }
    }
}

impl Default for MovingAverageSettings {
    fn default() -> Self {
        Self {
            windows: vec![5, 10, 15, 20, 30, 60, 90, 120, 180, 240],
            volume: true,
        }
    }
}

/// Values read from the environment; `None` leaves the file value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub database_url: Option<String>,
    pub epoch: Option<TradeDate>,
}

impl EnvOverrides {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: parse_env_var(DATABASE_URL_ENV)?,
            epoch: parse_env_var(EPOCH_ENV)?,
        })
    }
}

impl SyncConfig {
    /// Parses and validates a TOML document. Environment overrides are not applied.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let cfg: SyncConfig = toml::from_str(text).context("failed to parse config TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads `path` (defaults when `None`) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        let overrides = EnvOverrides::from_env()?;
        self.apply(overrides);
        self.validate()
    }

    pub fn apply(&mut self, overrides: EnvOverrides) {
        if let Some(url) = overrides.database_url {
            self.database_url = url;
        }
        if let Some(epoch) = overrides.epoch {
            self.epoch = epoch;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.database_url.trim().is_empty(), "database_url is empty");
        ensure!(!self.calendar.exchange.trim().is_empty(), "calendar.exchange is empty");
        self.timezone()?;
        ensure!(
            self.provider.requests_per_minute > 0,
            "provider.requests_per_minute must be positive"
        );
        let m = self.macd;
        if m.fast == 0 || m.slow == 0 || m.signal == 0 {
            bail!("macd periods must be positive");
        }
        ensure!(m.fast < m.slow, "macd.fast ({}) must be below macd.slow ({})", m.fast, m.slow);
        ensure!(
            !self.moving_average.windows.contains(&0),
            "moving_average.windows must be positive"
        );
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        parse_tz(&self.calendar.timezone)
    }

    /// The catalog this run uses, with the table overrides applied.
    pub fn catalog(&self) -> anyhow::Result<Catalog> {
        let mut catalog = match &self.catalog {
            Some(path) => load_catalog_path(path)?,
            None => default_catalog()?,
        };
        catalog.apply_overrides(&self.tables)?;
        Ok(catalog)
    }
}
