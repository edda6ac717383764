//! Outbound guild actions used by the guards.
//!
//! Everything that talks to Discord on behalf of RaidProtect, GlobalBan and
//! AntiSpam goes through [`GuildApi`], so the decision logic can run against
//! an in-memory double in tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::all::{
    ChannelId, EditGuild, EditMember, GuildId, Http, MessageId, Timestamp, UserId,
    VerificationLevel,
};
use serenity::async_trait;

use crate::error::GuardError;

/// Join-friction tiers, ordered from none to strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    None,
    Low,
    Medium,
    High,
    /// Verified phone required.
    Highest,
}

impl From<VerificationTier> for VerificationLevel {
    fn from(t: VerificationTier) -> Self {
        match t {
            VerificationTier::None => VerificationLevel::None,
            VerificationTier::Low => VerificationLevel::Low,
            VerificationTier::Medium => VerificationLevel::Medium,
            VerificationTier::High => VerificationLevel::High,
            VerificationTier::Highest => VerificationLevel::Higher,
        }
    }
}

impl VerificationTier {
    pub fn from_level(level: VerificationLevel) -> Option<Self> {
        match level {
            VerificationLevel::None => Some(VerificationTier::None),
            VerificationLevel::Low => Some(VerificationTier::Low),
            VerificationLevel::Medium => Some(VerificationTier::Medium),
            VerificationLevel::High => Some(VerificationTier::High),
            VerificationLevel::Higher => Some(VerificationTier::Highest),
            _ => None,
        }
    }
}

#[async_trait]
pub trait GuildApi: Send + Sync {
    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), GuardError>;
    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), GuardError>;
    async fn unban(&self, guild_id: u64, user_id: u64) -> Result<(), GuardError>;
    async fn verification_level(&self, guild_id: u64) -> Result<VerificationTier, GuardError>;
    async fn set_verification_level(
        &self,
        guild_id: u64,
        level: VerificationTier,
        reason: &str,
    ) -> Result<(), GuardError>;
    async fn timeout_member(
        &self,
        guild_id: u64,
        user_id: u64,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), GuardError>;
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), GuardError>;
    /// All member ids of a guild (paged through the REST API).
    async fn member_ids(&self, guild_id: u64) -> Result<Vec<u64>, GuardError>;
}

/// [`GuildApi`] over serenity's REST client.
#[derive(Clone)]
pub struct SerenityGuildApi {
    pub http: Arc<Http>,
}

impl SerenityGuildApi {
    pub fn new(http: Arc<Http>) -> Arc<Self> {
        Arc::new(Self { http })
    }
}

const MEMBER_PAGE: u64 = 1000;

#[async_trait]
impl GuildApi for SerenityGuildApi {
    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), GuardError> {
        GuildId::new(guild_id)
            .kick_with_reason(&self.http, UserId::new(user_id), reason)
            .await
            .map_err(|e| GuardError::from_serenity("kick", e))
    }

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<(), GuardError> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), 0, reason)
            .await
            .map_err(|e| GuardError::from_serenity("ban", e))
    }

    async fn unban(&self, guild_id: u64, user_id: u64) -> Result<(), GuardError> {
        GuildId::new(guild_id)
            .unban(&self.http, UserId::new(user_id))
            .await
            .map_err(|e| GuardError::from_serenity("unban", e))
    }

    async fn verification_level(&self, guild_id: u64) -> Result<VerificationTier, GuardError> {
        let guild = GuildId::new(guild_id)
            .to_partial_guild(self.http.as_ref())
            .await
            .map_err(|e| GuardError::from_serenity("read guild", e))?;
        VerificationTier::from_level(guild.verification_level)
            .ok_or_else(|| GuardError::Other("unknown verification level".into()))
    }

    async fn set_verification_level(
        &self,
        guild_id: u64,
        level: VerificationTier,
        reason: &str,
    ) -> Result<(), GuardError> {
        let builder = EditGuild::new()
            .verification_level(VerificationLevel::from(level))
            .audit_log_reason(reason);
        GuildId::new(guild_id)
            .edit(self.http.as_ref(), builder)
            .await
            .map(|_| ())
            .map_err(|e| GuardError::from_serenity("change verification level", e))
    }

    async fn timeout_member(
        &self,
        guild_id: u64,
        user_id: u64,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), GuardError> {
        let ts = Timestamp::from_unix_timestamp(until.timestamp())
            .map_err(|e| GuardError::Other(format!("bad timeout timestamp: {e}")))?;
        let builder = EditMember::new()
            .disable_communication_until_datetime(ts)
            .audit_log_reason(reason);
        GuildId::new(guild_id)
            .edit_member(self.http.as_ref(), UserId::new(user_id), builder)
            .await
            .map(|_| ())
            .map_err(|e| GuardError::from_serenity("time out member", e))
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), GuardError> {
        ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await
            .map_err(|e| GuardError::from_serenity("delete message", e))
    }

    async fn member_ids(&self, guild_id: u64) -> Result<Vec<u64>, GuardError> {
        let gid = GuildId::new(guild_id);
        let mut out = Vec::new();
        let mut after: Option<UserId> = None;
        loop {
            let page = gid
                .members(&self.http, Some(MEMBER_PAGE), after)
                .await
                .map_err(|e| GuardError::from_serenity("list members", e))?;
            let len = page.len() as u64;
            after = page.last().map(|m| m.user.id);
            out.extend(page.into_iter().map(|m| m.user.id.get()));
            if len < MEMBER_PAGE || after.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_map_both_ways() {
        for tier in [
            VerificationTier::None,
            VerificationTier::Low,
            VerificationTier::Medium,
            VerificationTier::High,
            VerificationTier::Highest,
        ] {
            let level: VerificationLevel = tier.into();
            assert_eq!(VerificationTier::from_level(level), Some(tier));
        }
    }

    #[test]
    fn highest_is_strictest() {
        assert!(VerificationTier::Highest > VerificationTier::High);
        assert!(VerificationTier::Medium > VerificationTier::Low);
    }
}
