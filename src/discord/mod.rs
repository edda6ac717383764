// src/discord/mod.rs
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::FutureExt;
use serenity::all::*;
use serenity::async_trait;

use crate::antispam::{AntiSpam, SpamAction, SpamMessage};
use crate::raidprotect::screening::JoinCandidate;
use crate::raidprotect::{self, JoinDecision};
use crate::{AppContext, default_gateway_intents, gban};

pub struct Handler {
    pub app: Arc<AppContext>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(guilds = ready.guilds.len(), "Logged in as {}", ready.user.name);
        self.app.set_bot_id(ready.user.id.get());
    }

    // Fires for every guild once after connect, and again when we are added somewhere.
    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        let gid = guild.id.get();
        if let Err(e) = register_commands_for_guild(&ctx, guild.id).await {
            tracing::warn!(error=?e, gid, "register_commands_for_guild failed (on guild_create)");
        }
        tracing::info!(guild=%guild.name, gid, "commands registered (see warnings if any failed)");
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let gid = member.guild_id.get();
        let uid = member.user.id.get();
        if uid == self.app.bot_id() {
            return;
        }

        if self.app.gban().on_member_join(gid, uid).await {
            return;
        }

        let Some(created_at) = chrono::DateTime::from_timestamp(member.user.created_at().unix_timestamp(), 0)
        else {
            tracing::warn!(gid, uid, "account creation time out of range, skipping screening");
            return;
        };
        let candidate = JoinCandidate {
            user_id: uid,
            display_name: member.display_name().to_string(),
            created_at,
        };

        let out = self.app.raidprotect().on_member_join(gid, &candidate).await;
        match out.decision {
            JoinDecision::Admit => tracing::debug!(gid, uid, window = ?out.window_count, "join admitted"),
            decision => tracing::info!(
                gid,
                uid,
                ?decision,
                window = ?out.window_count,
                trigger = ?out.trigger,
                ejected = out.ejected,
                "join rejected"
            ),
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else {
            return;
        };
        if msg.author.bot {
            return;
        }

        let spam = SpamMessage {
            guild_id: gid.get(),
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id: msg.author.id.get(),
            content: msg.content.clone(),
        };
        let notice = match self.app.antispam().on_message(&spam).await {
            SpamAction::Ignored | SpamAction::TimeoutFailed => return,
            SpamAction::DeleteFailed => (
                format!(
                    "⚠️ <@{}>: please stop flooding. I lack permission to delete messages here.",
                    spam.author_id
                ),
                Duration::from_secs(5),
            ),
            SpamAction::TimedOut { minutes } => (
                format!(
                    "🚫 Anti-spam: <@{}> was timed out for **{minutes} minute(s)** for flooding.",
                    spam.author_id
                ),
                Duration::from_secs(10),
            ),
        };
        post_transient(&ctx, msg.channel_id, notice.0, notice.1).await;
    }

    /// Slash command gate.
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let started = Instant::now();
        let name = interaction.as_command().map(|c| c.data.name.clone());

        let fut = async {
            raidprotect::commands::on_interaction(&ctx, &self.app, interaction.clone()).await;
            gban::commands::on_interaction(&ctx, &self.app, interaction.clone()).await;
            AntiSpam::on_interaction(&ctx, &self.app, interaction).await;
        };

        let result = AssertUnwindSafe(fut).catch_unwind().await;

        if let Some(name) = name {
            let status = if result.is_ok() { "ok" } else { "panic" };
            tracing::info!(command = %name, status, elapsed_ms = started.elapsed().as_millis() as u64, "command handled");
        }
    }
}

/// Sends a channel notice and removes it again after `ttl`.
async fn post_transient(ctx: &Context, channel_id: ChannelId, content: String, ttl: Duration) {
    let sent = channel_id
        .send_message(&ctx.http, CreateMessage::new().content(content))
        .await;
    match sent {
        Ok(message) => {
            let http = ctx.http.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Err(e) = message.delete(&http).await {
                    tracing::debug!(error=?e, "could not remove notice");
                }
            });
        }
        Err(e) => tracing::warn!(error=?e, channel=%channel_id.get(), "could not post notice"),
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "GUILD_MODERATION" => i |= GatewayIntents::GUILD_MODERATION,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            other => tracing::warn!(intent = other, "unknown intent in config, ignored"),
        }
    }
    if i.is_empty() { default_gateway_intents() } else { i }
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Missing Discord token (SHIELD_DISCORD__TOKEN). Set it in .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);
    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}

/* ============================================================
   COMMAND REGISTRY
   ============================================================ */
async fn register_commands_for_guild(ctx: &Context, guild_id: GuildId) -> Result<()> {
    if let Err(e) = raidprotect::commands::register_commands(ctx, guild_id).await {
        tracing::warn!(error=?e, gid=%guild_id.get(), "register raid failed");
    }
    if let Err(e) = gban::commands::register_commands(ctx, guild_id).await {
        tracing::warn!(error=?e, gid=%guild_id.get(), "register gban failed");
    }
    if let Err(e) = AntiSpam::register_commands(ctx, guild_id).await {
        tracing::warn!(error=?e, gid=%guild_id.get(), "register antispam failed");
    }
    Ok(())
}
