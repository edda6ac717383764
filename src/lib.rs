// src/lib.rs

pub mod antispam;
pub mod config;
pub mod discord;
pub mod error;
pub mod gban;
pub mod guild_api;
pub mod logging;
pub mod raidprotect;
pub mod store;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;

use config::Settings;
use guild_api::{GuildApi, SerenityGuildApi};

use serenity::all::{GatewayIntents, Http};

/// Process-wide context: settings plus the three guards, all sharing one [`GuildApi`].
pub struct AppContext {
    pub settings: Settings,
    raidprotect: Arc<raidprotect::RaidProtect>,
    gban: Arc<gban::GlobalBan>,
    antispam: Arc<antispam::AntiSpam>,
    /// Set once from the gateway `ready` event.
    bot_id: OnceCell<u64>,
}

impl AppContext {
    /// Logging, REST client, then the guards.
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);

        let http = Arc::new(Http::new(&settings.discord.token));
        let api: Arc<dyn GuildApi> = SerenityGuildApi::new(http);

        Self::with_api(settings, api).await
    }

    /// Builds the guards over any [`GuildApi`]. Fails on bad raid config.
    pub async fn with_api(settings: Settings, api: Arc<dyn GuildApi>) -> Result<Arc<Self>> {
        let policy = settings.raid.policy()?;
        let limits = settings.raid.limits()?;
        tracing::info!(
            window_secs = limits.time_window.as_secs(),
            threshold = limits.threshold,
            penalty_secs = limits.penalty.as_secs(),
            "raid protection configured"
        );

        let raidprotect = raidprotect::RaidProtect::new(policy, limits, api.clone());
        let gban = gban::GlobalBan::load(api.clone(), &settings.storage).await;
        let antispam =
            antispam::AntiSpam::load(settings.antispam.clone(), api, &settings.storage)
                .await;

        Ok(Arc::new(Self {
            settings,
            raidprotect,
            gban,
            antispam,
            bot_id: OnceCell::new(),
        }))
    }

    pub fn raidprotect(&self) -> Arc<raidprotect::RaidProtect> {
        self.raidprotect.clone()
    }

    pub fn gban(&self) -> Arc<gban::GlobalBan> {
        self.gban.clone()
    }

    pub fn antispam(&self) -> Arc<antispam::AntiSpam> {
        self.antispam.clone()
    }

    /// Our own user id, or 0 before the gateway said hello.
    pub fn bot_id(&self) -> u64 {
        self.bot_id.get().copied().unwrap_or(0)
    }

    pub fn set_bot_id(&self, id: u64) {
        let _ = self.bot_id.set(id);
    }
}

/// Intents the guards need: member joins, message content for anti-spam.
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
}

/// Start the Discord client (gateway + slash commands).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
