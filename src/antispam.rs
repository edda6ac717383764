//! AntiSpam: catches repeated-character floods ("aaaaaaaaaaaaaaaaaaaaaa").
//!
//! Off by default; switched per guild with `/antispam`. Settings live in
//! `guild_settings.json` keyed by guild id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::all::{
    CommandDataOptionValue, CommandOptionType, Context, CreateCommand, CreateCommandOption,
    EditInteractionResponse, GuildId, Interaction, Permissions,
};
use tracing::{info, warn};

use crate::AppContext;
use crate::config::{AntiSpamConfig, Storage};
use crate::guild_api::GuildApi;
use crate::store::JsonStore;

/// Discord caps member timeouts at 28 days.
pub const MAX_TIMEOUT_MINUTES: i64 = 40_320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSpamSettings {
    #[serde(default)]
    pub enabled: bool,
    pub timeout_minutes: u32,
}

/// The message fields the guard looks at.
#[derive(Debug, Clone)]
pub struct SpamMessage {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamAction {
    Ignored,
    /// Flood detected but the message could not be removed; nothing else done.
    DeleteFailed,
    TimedOut { minutes: u32 },
    /// Message removed, timeout refused.
    TimeoutFailed,
}

/// True when `content` is longer than `min_len` characters and a single
/// character makes up more than `ratio` of it. Case-insensitive.
pub fn is_char_flood(content: &str, min_len: usize, ratio: f64) -> bool {
    let lowered = content.to_lowercase();
    let total = lowered.chars().count();
    if total <= min_len {
        return false;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in lowered.chars() {
        *counts.entry(c).or_default() += 1;
    }
    let top = counts.values().copied().max().unwrap_or(0);
    top as f64 / total as f64 > ratio
}

pub struct AntiSpam {
    cfg: AntiSpamConfig,
    api: Arc<dyn GuildApi>,
    guilds: DashMap<u64, GuildSpamSettings>,
    store: JsonStore<BTreeMap<String, GuildSpamSettings>>,
    save_lock: tokio::sync::Mutex<()>,
}

impl AntiSpam {
    pub async fn load(cfg: AntiSpamConfig, api: Arc<dyn GuildApi>, storage: &Storage) -> Arc<Self> {
        let store: JsonStore<BTreeMap<String, GuildSpamSettings>> =
            JsonStore::new(storage.guild_settings_path());
        let guilds = DashMap::new();
        for (gid, s) in store.load().await {
            match gid.parse::<u64>() {
                Ok(id) => {
                    guilds.insert(id, s);
                }
                Err(_) => warn!(key = %gid, "skipping guild settings with non-numeric id"),
            }
        }
        Arc::new(Self {
            cfg,
            api,
            guilds,
            store,
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self, guild_id: u64) -> GuildSpamSettings {
        self.guilds
            .get(&guild_id)
            .map(|s| *s)
            .unwrap_or(GuildSpamSettings {
                enabled: false,
                timeout_minutes: self.cfg.default_timeout_minutes,
            })
    }

    /// Saves first; the in-memory settings only change when the file was written.
    pub async fn configure(&self, guild_id: u64, enabled: bool, timeout_minutes: u32) -> Result<()> {
        let settings = GuildSpamSettings {
            enabled,
            timeout_minutes,
        };
        let _guard = self.save_lock.lock().await;
        let mut doc: BTreeMap<String, GuildSpamSettings> = self
            .guilds
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        doc.insert(guild_id.to_string(), settings);
        self.store.save(&doc).await?;
        self.guilds.insert(guild_id, settings);
        info!(gid = guild_id, enabled, timeout_minutes, "antispam configured");
        Ok(())
    }

    pub async fn on_message(&self, msg: &SpamMessage) -> SpamAction {
        let settings = self.settings(msg.guild_id);
        if !settings.enabled
            || !is_char_flood(&msg.content, self.cfg.min_length, self.cfg.dominant_ratio)
        {
            return SpamAction::Ignored;
        }

        if let Err(e) = self.api.delete_message(msg.channel_id, msg.message_id).await {
            warn!(error = %e, gid = msg.guild_id, uid = msg.author_id, "could not delete flood message");
            return SpamAction::DeleteFailed;
        }

        let minutes = settings.timeout_minutes;
        let until = Utc::now() + ChronoDuration::minutes(i64::from(minutes));
        let reason = format!("Auto anti-spam: repeated-character flood (timeout {minutes}m)");
        match self
            .api
            .timeout_member(msg.guild_id, msg.author_id, until, &reason)
            .await
        {
            Ok(()) => {
                info!(gid = msg.guild_id, uid = msg.author_id, minutes, "flooder timed out");
                SpamAction::TimedOut { minutes }
            }
            Err(e) => {
                warn!(error = %e, gid = msg.guild_id, uid = msg.author_id, "could not time out flooder");
                SpamAction::TimeoutFailed
            }
        }
    }

    pub async fn register_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
        guild_id
            .create_command(
                &ctx.http,
                CreateCommand::new("antispam")
                    .description("Toggle the repeated-character flood guard")
                    .default_member_permissions(Permissions::ADMINISTRATOR)
                    .add_option(
                        CreateCommandOption::new(CommandOptionType::String, "switch", "on|off")
                            .required(true)
                            .add_string_choice("on", "on")
                            .add_string_choice("off", "off"),
                    )
                    .add_option(CreateCommandOption::new(
                        CommandOptionType::Integer,
                        "timeout_minutes",
                        "Timeout for flooders, 1-40320 minutes (default 10)",
                    )),
            )
            .await?;
        Ok(())
    }

    pub async fn handle_command(
        &self,
        guild_id: u64,
        switch: &str,
        timeout_minutes: Option<i64>,
    ) -> String {
        let enabled = match switch {
            "on" => true,
            "off" => false,
            other => return format!("unknown switch `{other}`, use on or off"),
        };
        let minutes = timeout_minutes.unwrap_or(i64::from(self.cfg.default_timeout_minutes));
        if !(1..=MAX_TIMEOUT_MINUTES).contains(&minutes) {
            return format!("timeout_minutes must be between 1 and {MAX_TIMEOUT_MINUTES}");
        }
        if let Err(e) = self.configure(guild_id, enabled, minutes as u32).await {
            warn!(error = ?e, gid = guild_id, "saving antispam settings failed");
            return "could not save settings".into();
        }
        if enabled {
            format!("anti-spam enabled; flooders are timed out for {minutes} minute(s)")
        } else {
            "anti-spam disabled".into()
        }
    }

    pub async fn on_interaction(ctx: &Context, app: &AppContext, interaction: Interaction) {
        let Some(cmd) = interaction.command() else {
            return;
        };
        if cmd.data.name != "antispam" {
            return;
        }
        if let Err(err) = cmd.defer_ephemeral(&ctx.http).await {
            tracing::warn!("failed to defer antispam interaction: {:?}", err);
        }
        let Some(guild_id) = cmd.guild_id else {
            return;
        };

        let mut switch = String::new();
        let mut minutes = None;
        for o in &cmd.data.options {
            match (o.name.as_str(), &o.value) {
                ("switch", CommandDataOptionValue::String(s)) => switch = s.clone(),
                ("timeout_minutes", CommandDataOptionValue::Integer(n)) => minutes = Some(*n),
                _ => {}
            }
        }

        let content = app
            .antispam()
            .handle_command(guild_id.get(), &switch, minutes)
            .await;
        if let Err(err) = cmd
            .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
            .await
        {
            tracing::warn!("failed to edit antispam response: {:?}", err);
        }
    }
}
