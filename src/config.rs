use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::guild_api::VerificationTier;
use crate::raidprotect::controller::RaidLimits;
use crate::raidprotect::screening::ScreeningPolicy;

/// Upper bound for `raid.penalty_secs` (30 days).
pub const MAX_PENALTY_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub discord: Discord,
    pub logging: Logging,
    pub raid: RaidConfig,
    pub antispam: AntiSpamConfig,
    pub storage: Storage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discord {
    pub token: String,
    pub intents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

/// Raid detector / screening knobs. Read once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaidConfig {
    /// Sliding window for the join counter, in seconds.
    pub time_window_secs: u64,
    /// Joins inside the window that switch the guild into raid mode.
    pub threshold: usize,
    /// How long raid mode lasts after the last trigger, in seconds.
    pub penalty_secs: u64,
    pub min_account_age_days: i64,
    /// Regexes matched against the lowercased display name, in order.
    pub name_patterns: Vec<String>,
    /// Verification level forced while raid mode is active.
    pub raid_level: VerificationTier,
    /// Used on exit when the pre-raid level could not be read.
    pub fallback_level: VerificationTier,
}

impl Default for RaidConfig {
    fn default() -> Self {
        Self {
            time_window_secs: 5,
            threshold: 10,
            penalty_secs: 600,
            min_account_age_days: 7,
            name_patterns: vec![
                r"[0-9]{3,}".into(),
                r"discord\.gg".into(),
                r"http(s)?://.".into(),
            ],
            raid_level: VerificationTier::Highest,
            fallback_level: VerificationTier::Medium,
        }
    }
}

impl RaidConfig {
    /// Compiles the name patterns. A bad pattern is a startup error, not a silent skip.
    pub fn policy(&self) -> Result<ScreeningPolicy> {
        let patterns = self
            .name_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid raid.name_patterns entry `{p}`")))
            .collect::<Result<Vec<_>>>()?;
        if self.min_account_age_days < 0 {
            bail!("raid.min_account_age_days must not be negative");
        }
        let min_account_age = chrono::TimeDelta::try_days(self.min_account_age_days)
            .with_context(|| {
                format!("raid.min_account_age_days `{}` is out of range", self.min_account_age_days)
            })?;
        Ok(ScreeningPolicy {
            min_account_age,
            name_patterns: patterns,
        })
    }

    pub fn limits(&self) -> Result<RaidLimits> {
        if self.penalty_secs > MAX_PENALTY_SECS {
            bail!(
                "raid.penalty_secs `{}` exceeds the maximum of {MAX_PENALTY_SECS}",
                self.penalty_secs
            );
        }
        Ok(RaidLimits {
            time_window: Duration::from_secs(self.time_window_secs),
            threshold: self.threshold.max(1),
            penalty: Duration::from_secs(self.penalty_secs),
            raid_level: self.raid_level,
            fallback_level: self.fallback_level,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AntiSpamConfig {
    /// Messages at or below this many characters are never checked.
    pub min_length: usize,
    /// Share of the most common character above which a message counts as flood.
    pub dominant_ratio: f64,
    pub default_timeout_minutes: u32,
}

impl Default for AntiSpamConfig {
    fn default() -> Self {
        Self {
            min_length: 20,
            dominant_ratio: 0.5,
            default_timeout_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Storage {
    pub data_dir: PathBuf,
}

impl Storage {
    pub fn blacklist_path(&self) -> PathBuf {
        self.data_dir.join("global_blacklist.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("gban_history.json")
    }

    pub fn guild_settings_path(&self) -> PathBuf {
        self.data_dir.join("guild_settings.json")
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Which environment?
        let env = std::env::var("SHIELD_ENV").unwrap_or_else(|_| "development".to_string());

        // .env.<env> first, then plain .env (both optional)
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        let defaults = Settings::defaults(env.clone());

        // Layers: defaults -> TOML file -> SHIELD_* env vars
        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // SHIELD_DISCORD__TOKEN => discord.token, SHIELD_RAID__PENALTY_SECS => raid.penalty_secs
            .merge(Env::prefixed("SHIELD_").split("__"));

        let mut s: Settings = figment.extract()?;
        s.env = env;
        Ok(s)
    }

    pub fn defaults(env: String) -> Self {
        Self {
            env,
            app: App {
                name: "RaidShield".into(),
            },
            discord: Discord {
                token: "".into(),
                intents: vec![
                    "GUILDS".into(),
                    "GUILD_MEMBERS".into(),
                    "GUILD_MESSAGES".into(),
                    "MESSAGE_CONTENT".into(),
                ],
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            raid: RaidConfig::default(),
            antispam: AntiSpamConfig::default(),
            storage: Storage {
                data_dir: PathBuf::from("data"),
            },
        }
    }
}
