//! GlobalBan: one blacklist shared by every guild the bot is in.
//!
//! Blacklisted users are banned the moment they join any guild. The list and
//! an append-only audit history live in two flat JSON files.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::Storage;
use crate::guild_api::GuildApi;
use crate::store::JsonStore;

pub mod commands;

pub const DEFAULT_REASON: &str = "no reason given";
/// Embed descriptions cap at 4096; stay well below.
pub const PAGE_CHARS: usize = 3800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub added_by: String,
    pub timestamp: String,
}

/// user id (as string) -> entry
pub type Blacklist = BTreeMap<String, BlacklistEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    #[serde(rename = "gban_add")]
    Add,
    #[serde(rename = "gban_remove")]
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    pub id: String,
    pub full_tag: String,
    #[serde(default)]
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub action: HistoryAction,
    pub command_used: String,
    pub target_id: String,
    pub executor: Executor,
    #[serde(default)]
    pub ban_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyListed,
}

pub struct GlobalBan {
    api: Arc<dyn GuildApi>,
    blacklist: RwLock<Blacklist>,
    blacklist_store: JsonStore<Blacklist>,
    history_store: JsonStore<Vec<HistoryEntry>>,
    /// Serialises read-modify-write of the history file.
    history_lock: Mutex<()>,
}

impl GlobalBan {
    pub async fn load(api: Arc<dyn GuildApi>, storage: &Storage) -> Arc<Self> {
        let blacklist_store = JsonStore::new(storage.blacklist_path());
        let history_store = JsonStore::new(storage.history_path());
        let blacklist: Blacklist = blacklist_store.load().await;
        info!(entries = blacklist.len(), "global blacklist loaded");
        Arc::new(Self {
            api,
            blacklist: RwLock::new(blacklist),
            blacklist_store,
            history_store,
            history_lock: Mutex::new(()),
        })
    }

    pub async fn entry(&self, user_id: u64) -> Option<BlacklistEntry> {
        self.blacklist.read().await.get(&user_id.to_string()).cloned()
    }

    /// Bans a joining member who is on the list. Returns true when the member
    /// was blacklisted (whether or not the ban call succeeded).
    pub async fn on_member_join(&self, guild_id: u64, user_id: u64) -> bool {
        let Some(entry) = self.entry(user_id).await else {
            return false;
        };
        warn!(gid = guild_id, uid = user_id, "blacklisted user joined, banning");
        let reason = format!("[global blacklist auto-ban] reason: {}", entry.reason);
        if let Err(e) = self.api.ban(guild_id, user_id, &reason).await {
            warn!(error = %e, gid = guild_id, uid = user_id, "auto-ban failed");
        }
        true
    }

    pub async fn add(&self, user_id: u64, reason: &str, executor: &Executor) -> Result<AddOutcome> {
        let key = user_id.to_string();
        let timestamp = now_string();
        {
            let mut list = self.blacklist.write().await;
            if list.contains_key(&key) {
                return Ok(AddOutcome::AlreadyListed);
            }
            // memory only changes once the file does
            let mut next = list.clone();
            next.insert(
                key.clone(),
                BlacklistEntry {
                    reason: reason.to_string(),
                    added_by: executor.full_tag.clone(),
                    timestamp: timestamp.clone(),
                },
            );
            self.blacklist_store.save(&next).await?;
            *list = next;
        }
        self.append_history(HistoryEntry {
            timestamp,
            action: HistoryAction::Add,
            command_used: format!("/gban ban {key} {reason}"),
            target_id: key,
            executor: executor.clone(),
            ban_reason: Some(reason.to_string()),
        })
        .await?;
        info!(uid = user_id, by = %executor.full_tag, "user added to global blacklist");
        Ok(AddOutcome::Added)
    }

    /// Returns false when the id was not listed.
    pub async fn remove(&self, user_id: u64, executor: &Executor) -> Result<bool> {
        let key = user_id.to_string();
        {
            let mut list = self.blacklist.write().await;
            if !list.contains_key(&key) {
                return Ok(false);
            }
            let mut next = list.clone();
            next.remove(&key);
            self.blacklist_store.save(&next).await?;
            *list = next;
        }
        self.append_history(HistoryEntry {
            timestamp: now_string(),
            action: HistoryAction::Remove,
            command_used: format!("/gban unban {key}"),
            target_id: key,
            executor: executor.clone(),
            ban_reason: None,
        })
        .await?;
        info!(uid = user_id, by = %executor.full_tag, "user removed from global blacklist");
        Ok(true)
    }

    /// Lifts the local ban in one guild. A missing ban is not an error worth surfacing.
    pub async fn unban_local(&self, guild_id: u64, user_id: u64) {
        if let Err(e) = self.api.unban(guild_id, user_id).await {
            warn!(error = %e, gid = guild_id, uid = user_id, "local unban failed");
        }
    }

    /// Bans every current member of `guild_id` that is on the list (except `skip_id`,
    /// the bot itself). Returns how many bans went through.
    pub async fn sync_guild(&self, guild_id: u64, skip_id: u64) -> Result<usize> {
        let members = self.api.member_ids(guild_id).await?;
        let targets: Vec<(u64, String)> = {
            let list = self.blacklist.read().await;
            members
                .into_iter()
                .filter(|id| *id != skip_id)
                .filter_map(|id| list.get(&id.to_string()).map(|e| (id, e.reason.clone())))
                .collect()
        };

        let mut banned = 0;
        for (uid, reason) in targets {
            let audit = format!("[global blacklist sync] reason: {reason}");
            match self.api.ban(guild_id, uid, &audit).await {
                Ok(()) => banned += 1,
                Err(e) => warn!(error = %e, gid = guild_id, uid, "sync ban failed"),
            }
        }
        info!(gid = guild_id, banned, "global blacklist sync finished");
        Ok(banned)
    }

    pub async fn history_for(&self, user_id: u64) -> Vec<HistoryEntry> {
        let key = user_id.to_string();
        self.history_store
            .load()
            .await
            .into_iter()
            .filter(|h| h.target_id == key)
            .collect()
    }

    pub async fn entries(&self) -> Vec<(String, BlacklistEntry)> {
        self.blacklist
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        let _guard = self.history_lock.lock().await;
        let mut history = self.history_store.load().await;
        history.push(entry);
        self.history_store.save(&history).await
    }
}

fn now_string() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parses a raw user id typed into a slash command.
pub fn parse_user_id(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|id| *id != 0)
}

/// Packs list lines into pages of at most `max` bytes each. A line longer
/// than a page is cut on char boundaries and carried over.
pub fn paginate(lines: &[String], max: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();
    for line in lines {
        for piece in split_at_most(line, max) {
            if !current.is_empty() && current.len() + piece.len() > max {
                pages.push(std::mem::take(&mut current));
            }
            current.push_str(piece);
        }
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}

fn split_at_most(mut rest: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    while rest.len() > max {
        let mut cut = max;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // a single char wider than `max`
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}
