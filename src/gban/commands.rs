use anyhow::Result;
use serenity::all::{
    CommandDataOption, CommandDataOptionValue, CommandInteraction, CommandOptionType, Context,
    CreateCommand, CreateCommandOption, CreateEmbed, CreateEmbedFooter,
    CreateInteractionResponseFollowup, EditInteractionResponse, GuildId, Interaction, Permissions,
};

use crate::AppContext;

use super::{AddOutcome, DEFAULT_REASON, Executor, HistoryAction, PAGE_CHARS, paginate, parse_user_id};

/// What a `/gban` subcommand answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GbanReply {
    Text(String),
    /// One embed per page.
    Pages { title: String, pages: Vec<String> },
}

fn user_id_option(name: &'static str, description: &'static str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::String, name, description).required(true)
}

pub async fn register_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id
        .create_command(
            &ctx.http,
            CreateCommand::new("gban")
                .description("Global blacklist shared by every server")
                .default_member_permissions(Permissions::ADMINISTRATOR)
                .add_option(
                    CreateCommandOption::new(
                        CommandOptionType::SubCommand,
                        "ban",
                        "Add a user id to the global blacklist",
                    )
                    .add_sub_option(user_id_option("user_id", "User id to blacklist"))
                    .add_sub_option(CreateCommandOption::new(
                        CommandOptionType::String,
                        "reason",
                        "Reason",
                    )),
                )
                .add_option(
                    CreateCommandOption::new(
                        CommandOptionType::SubCommand,
                        "unban",
                        "Remove a user id from the global blacklist",
                    )
                    .add_sub_option(user_id_option("user_id", "User id to remove")),
                )
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "sync",
                    "Ban every blacklisted member of this server",
                ))
                .add_option(
                    CreateCommandOption::new(
                        CommandOptionType::SubCommand,
                        "history",
                        "Show blacklist history of a user id",
                    )
                    .add_sub_option(user_id_option("user_id", "User id to look up")),
                )
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "list",
                    "Show the whole global blacklist",
                )),
        )
        .await?;
    Ok(())
}

pub async fn handle_subcommand(
    app: &AppContext,
    guild_id: u64,
    executor: &Executor,
    name: &str,
    user_id: Option<&str>,
    reason: Option<&str>,
) -> GbanReply {
    let gban = app.gban();
    let needs_id = matches!(name, "ban" | "unban" | "history");
    let target = match user_id.map(parse_user_id) {
        Some(Some(id)) => Some(id),
        _ if needs_id => {
            return GbanReply::Text("invalid user id, it must be a plain number".into());
        }
        _ => None,
    };

    match (name, target) {
        ("ban", Some(uid)) => {
            let reason = reason.filter(|r| !r.trim().is_empty()).unwrap_or(DEFAULT_REASON);
            match gban.add(uid, reason, executor).await {
                Ok(AddOutcome::AlreadyListed) => {
                    GbanReply::Text(format!("user id `{uid}` is already on the global blacklist"))
                }
                Ok(AddOutcome::Added) => {
                    let synced = match gban.sync_guild(guild_id, app.bot_id()).await {
                        Ok(n) => format!("banned {n} listed member(s) here"),
                        Err(e) => format!("local sync failed: {e}"),
                    };
                    GbanReply::Text(format!(
                        "user id `{uid}` added to the global blacklist (reason: {reason}); {synced}"
                    ))
                }
                Err(e) => GbanReply::Text(format!("could not save blacklist: {e}")),
            }
        }
        ("unban", Some(uid)) => match gban.remove(uid, executor).await {
            Ok(false) => GbanReply::Text(format!("user id `{uid}` is not on the global blacklist")),
            Ok(true) => {
                gban.unban_local(guild_id, uid).await;
                GbanReply::Text(format!("user id `{uid}` removed from the global blacklist"))
            }
            Err(e) => GbanReply::Text(format!("could not save blacklist: {e}")),
        },
        ("sync", _) => match gban.sync_guild(guild_id, app.bot_id()).await {
            Ok(0) => GbanReply::Text("sync done, no blacklisted members found".into()),
            Ok(n) => GbanReply::Text(format!("sync done, banned {n} blacklisted member(s)")),
            Err(e) => GbanReply::Text(format!("sync failed: {e}")),
        },
        ("history", Some(uid)) => {
            let history = gban.history_for(uid).await;
            if history.is_empty() {
                return GbanReply::Text(format!("no blacklist history for user id `{uid}`"));
            }
            let lines: Vec<String> = history
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    let action = match h.action {
                        HistoryAction::Add => "added",
                        HistoryAction::Remove => "removed",
                    };
                    format!(
                        "**{}. {action}** at {}\nby {} ({})\nreason: {}\n`{}`\n\n",
                        i + 1,
                        h.timestamp,
                        h.executor.full_tag,
                        h.executor.id,
                        h.ban_reason.as_deref().unwrap_or("-"),
                        h.command_used,
                    )
                })
                .collect();
            GbanReply::Pages {
                title: format!("Blacklist history of {uid}"),
                pages: paginate(&lines, PAGE_CHARS),
            }
        }
        ("list", _) => {
            let entries = gban.entries().await;
            if entries.is_empty() {
                return GbanReply::Text("the global blacklist is empty".into());
            }
            let lines: Vec<String> = entries
                .iter()
                .map(|(uid, e)| {
                    format!(
                        "• **<@{uid}> ({uid})**\n  > reason: {}\n  > added by: {} ({})\n",
                        e.reason, e.added_by, e.timestamp
                    )
                })
                .collect();
            GbanReply::Pages {
                title: format!("Global blacklist ({} users)", entries.len()),
                pages: paginate(&lines, PAGE_CHARS),
            }
        }
        _ => GbanReply::Text(String::new()),
    }
}

fn string_option<'a>(options: &'a [CommandDataOption], name: &str) -> Option<&'a str> {
    let CommandDataOptionValue::SubCommand(inner) = &options.first()?.value else {
        return None;
    };
    inner.iter().find_map(|o| match (&o.value, o.name == name) {
        (CommandDataOptionValue::String(s), true) => Some(s.as_str()),
        _ => None,
    })
}

async fn send_reply(ctx: &Context, cmd: &CommandInteraction, reply: GbanReply) {
    let res = match reply {
        GbanReply::Text(text) => cmd
            .edit_response(&ctx.http, EditInteractionResponse::new().content(text))
            .await
            .map(|_| ()),
        GbanReply::Pages { title, pages } => {
            let total = pages.len();
            let embed = |i: usize, page: String| {
                CreateEmbed::new()
                    .title(title.clone())
                    .description(page)
                    .footer(CreateEmbedFooter::new(format!("page {}/{total}", i + 1)))
            };
            let mut res = Ok(());
            for (i, page) in pages.into_iter().enumerate() {
                let sent = if i == 0 {
                    cmd.edit_response(&ctx.http, EditInteractionResponse::new().embed(embed(i, page)))
                        .await
                        .map(|_| ())
                } else {
                    cmd.create_followup(
                        &ctx.http,
                        CreateInteractionResponseFollowup::new()
                            .ephemeral(true)
                            .embed(embed(i, page)),
                    )
                    .await
                    .map(|_| ())
                };
                if sent.is_err() {
                    res = sent;
                    break;
                }
            }
            res
        }
    };
    if let Err(err) = res {
        tracing::warn!("failed to send gban response: {:?}", err);
    }
}

pub async fn on_interaction(ctx: &Context, app: &AppContext, interaction: Interaction) {
    let Some(cmd) = interaction.command() else {
        return;
    };
    if cmd.data.name != "gban" {
        return;
    }
    if let Err(err) = cmd.defer_ephemeral(&ctx.http).await {
        tracing::warn!("failed to defer gban interaction: {:?}", err);
    }
    let Some(guild_id) = cmd.guild_id else {
        return;
    };
    let Some(sub) = cmd.data.options.first() else {
        return;
    };

    let executor = Executor {
        id: cmd.user.id.get().to_string(),
        full_tag: cmd.user.tag(),
        guild_id: Some(guild_id.get().to_string()),
    };
    let options = &cmd.data.options;
    let reply = handle_subcommand(
        app,
        guild_id.get(),
        &executor,
        &sub.name,
        string_option(options, "user_id"),
        string_option(options, "reason"),
    )
    .await;
    tracing::info!(gid = guild_id.get(), uid = cmd.user.id.get(), sub = %sub.name, "/gban used");

    send_reply(ctx, &cmd, reply).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::guild_api::VerificationTier;
    use crate::raidprotect::controller::tests::MockApi;
    use std::sync::Arc;

    async fn app() -> (Arc<AppContext>, Arc<MockApi>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::defaults("test".into());
        settings.storage.data_dir = dir.path().to_path_buf();
        let api = Arc::new(MockApi::with_level(VerificationTier::Low));
        let app = AppContext::with_api(settings, api.clone()).await.unwrap();
        (app, api, dir)
    }

    fn admin() -> Executor {
        Executor {
            id: "9".into(),
            full_tag: "admin".into(),
            guild_id: Some("1".into()),
        }
    }

    fn text(reply: GbanReply) -> String {
        match reply {
            GbanReply::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ban_rejects_bad_id() {
        let (app, _, _dir) = app().await;
        let msg = text(handle_subcommand(&app, 1, &admin(), "ban", Some("12ab"), None).await);
        assert!(msg.starts_with("invalid user id"));
    }

    #[tokio::test]
    async fn ban_then_duplicate_then_unban() {
        let (app, _, _dir) = app().await;
        let msg = text(handle_subcommand(&app, 1, &admin(), "ban", Some("123"), None).await);
        assert!(msg.contains("added"), "{msg}");
        assert!(msg.contains(DEFAULT_REASON));

        let msg = text(handle_subcommand(&app, 1, &admin(), "ban", Some("123"), Some("x")).await);
        assert!(msg.contains("already"));

        let msg = text(handle_subcommand(&app, 1, &admin(), "unban", Some("123"), None).await);
        assert!(msg.contains("removed"));
        let msg = text(handle_subcommand(&app, 1, &admin(), "unban", Some("123"), None).await);
        assert!(msg.contains("not on"));
    }

    #[tokio::test]
    async fn list_and_history_are_paged() {
        let (app, _, _dir) = app().await;
        assert_eq!(
            text(handle_subcommand(&app, 1, &admin(), "list", None, None).await),
            "the global blacklist is empty"
        );
        handle_subcommand(&app, 1, &admin(), "ban", Some("5"), Some("raid")).await;

        match handle_subcommand(&app, 1, &admin(), "list", None, None).await {
            GbanReply::Pages { title, pages } => {
                assert!(title.contains("1 users"));
                assert_eq!(pages.len(), 1);
                assert!(pages[0].contains("reason: raid"));
            }
            other => panic!("{other:?}"),
        }
        match handle_subcommand(&app, 1, &admin(), "history", Some("5"), None).await {
            GbanReply::Pages { pages, .. } => assert!(pages[0].contains("added")),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_with_no_members() {
        let (app, api, _dir) = app().await;
        let msg = text(handle_subcommand(&app, 1, &admin(), "sync", None, None).await);
        assert!(msg.contains("no blacklisted members"));
        assert!(api.bans.lock().unwrap().is_empty());
    }
}
