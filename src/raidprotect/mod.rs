//! RaidProtect: front-door defence for new members.
//!
//! Every join goes through, in this order:
//! 1. account-age check (anti-alts),
//! 2. suspicious-name check,
//! 3. join-window update (may switch the guild into raid mode),
//! 4. raid-mode enforcement.
//!
//! The first rejection wins and the member is kicked. A kick that fails is
//! logged and not retried; bookkeeping from steps 3-4 is never rolled back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::guild_api::GuildApi;

pub mod commands;
pub mod controller;
pub mod screening;
pub mod window;

use controller::{FloodCheck, RaidController, RaidLimits, TriggerOutcome};
use screening::{JoinCandidate, ScreeningPolicy, Verdict};

const RAID_KICK_REASON: &str = "[RaidProtect: Flood] server is under raid-defense mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Admit,
    RejectAge,
    RejectName,
    RejectRaid,
}

/// What happened to one joining member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub decision: JoinDecision,
    /// Window count, present only when the join reached the flood detector.
    pub window_count: Option<usize>,
    pub trigger: Option<TriggerOutcome>,
    /// The kick call went through (always false for `Admit`).
    pub ejected: bool,
}

pub struct RaidProtect {
    policy: ScreeningPolicy,
    controller: Arc<RaidController>,
    api: Arc<dyn GuildApi>,
}

impl RaidProtect {
    pub fn new(policy: ScreeningPolicy, limits: RaidLimits, api: Arc<dyn GuildApi>) -> Arc<Self> {
        let controller = RaidController::new(limits, api.clone());
        Arc::new(Self {
            policy,
            controller,
            api,
        })
    }

    pub fn controller(&self) -> &Arc<RaidController> {
        &self.controller
    }

    pub async fn on_member_join(&self, guild_id: u64, candidate: &JoinCandidate) -> JoinOutcome {
        self.handle_join(guild_id, candidate, Utc::now(), Instant::now())
            .await
    }

    /// Same as [`Self::on_member_join`] with explicit clocks: `wall` for account
    /// age (UTC), `mono` for the join window and raid expiry.
    pub async fn handle_join(
        &self,
        guild_id: u64,
        candidate: &JoinCandidate,
        wall: DateTime<Utc>,
        mono: Instant,
    ) -> JoinOutcome {
        // 1-2) screening
        let verdict = self.policy.screen(candidate, wall);
        if verdict.is_reject() {
            let reason = self.policy.reason(verdict).unwrap_or_default();
            let ejected = self.eject(guild_id, candidate, &reason).await;
            return JoinOutcome {
                decision: match verdict {
                    Verdict::RejectAge => JoinDecision::RejectAge,
                    _ => JoinDecision::RejectName,
                },
                window_count: None,
                trigger: None,
                ejected,
            };
        }

        // 3-4) flood window + raid mode
        let FloodCheck {
            window_count,
            trigger,
            raid_active,
        } = self.controller.check_join(guild_id, mono).await;

        if !raid_active {
            return JoinOutcome {
                decision: JoinDecision::Admit,
                window_count: Some(window_count),
                trigger,
                ejected: false,
            };
        }

        let ejected = self.eject(guild_id, candidate, RAID_KICK_REASON).await;
        JoinOutcome {
            decision: JoinDecision::RejectRaid,
            window_count: Some(window_count),
            trigger,
            ejected,
        }
    }

    async fn eject(&self, guild_id: u64, candidate: &JoinCandidate, reason: &str) -> bool {
        match self.api.kick(guild_id, candidate.user_id, reason).await {
            Ok(()) => {
                info!(
                    gid = guild_id,
                    uid = candidate.user_id,
                    name = %candidate.display_name,
                    %reason,
                    "member kicked by RaidProtect"
                );
                true
            }
            Err(e) if e.is_permission_denied() => {
                warn!(gid = guild_id, uid = candidate.user_id, "missing permission to kick joining member");
                false
            }
            Err(e) => {
                warn!(error = %e, gid = guild_id, uid = candidate.user_id, "kick failed");
                false
            }
        }
    }
}
