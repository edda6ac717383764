use anyhow::Result;
use serenity::all::{
    CommandOptionType, Context, CreateCommand, CreateCommandOption, EditInteractionResponse,
    GuildId, Interaction, Permissions,
};
use tokio::time::Instant;

use crate::AppContext;

use super::controller::RaidState;

pub async fn register_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id
        .create_command(
            &ctx.http,
            CreateCommand::new("raid")
                .description("Raid-defense mode")
                .default_member_permissions(Permissions::ADMINISTRATOR)
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "status",
                    "Show raid mode and recent joins",
                ))
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "end",
                    "Lift raid mode now and restore the verification level",
                )),
        )
        .await?;
    Ok(())
}

pub async fn handle_subcommand(app: &AppContext, guild_id: u64, name: &str) -> String {
    let controller = app.raidprotect().controller().clone();
    match name {
        "status" => {
            let now = Instant::now();
            let status = controller.status(guild_id, now).await;
            let window = controller.limits().time_window.as_secs();
            let joins = format!("{} join(s) in the last {window}s", status.window_count);
            match status.state {
                RaidState::RaidActive { expiry } => {
                    let left = expiry.saturating_duration_since(now).as_secs();
                    format!("raid mode active, {left}s remaining; {joins}")
                }
                RaidState::Normal => format!("normal; {joins}"),
            }
        }
        "end" => {
            if controller.end(guild_id).await {
                "raid mode lifted, verification level restored".into()
            } else {
                "raid mode is not active".into()
            }
        }
        _ => String::new(),
    }
}

pub async fn on_interaction(ctx: &Context, app: &AppContext, interaction: Interaction) {
    let Some(cmd) = interaction.command() else {
        return;
    };
    if cmd.data.name != "raid" {
        return;
    }
    if let Err(err) = cmd.defer_ephemeral(&ctx.http).await {
        tracing::warn!("failed to defer raid interaction: {:?}", err);
    }
    let Some(guild_id) = cmd.guild_id else {
        return;
    };
    let Some(sub) = cmd.data.options.first() else {
        return;
    };

    let content = handle_subcommand(app, guild_id.get(), &sub.name).await;
    tracing::info!(gid = guild_id.get(), uid = cmd.user.id.get(), sub = %sub.name, "/raid used");

    if let Err(err) = cmd
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await
    {
        tracing::warn!("failed to edit raid response: {:?}", err);
    }
}
