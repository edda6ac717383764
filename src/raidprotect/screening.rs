use chrono::{DateTime, Duration, Utc};
use regex::Regex;

/// Process-wide screening rules. Built once from config and never mutated.
#[derive(Debug, Clone)]
pub struct ScreeningPolicy {
    pub min_account_age: Duration,
    pub name_patterns: Vec<Regex>,
}

/// What screening knows about a joining member.
#[derive(Debug, Clone)]
pub struct JoinCandidate {
    pub user_id: u64,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    RejectAge,
    RejectName,
}

impl Verdict {
    pub fn is_reject(self) -> bool {
        !matches!(self, Verdict::Admit)
    }
}

impl ScreeningPolicy {
    /// Age first, then name. The first rule that fires decides.
    pub fn screen(&self, candidate: &JoinCandidate, now: DateTime<Utc>) -> Verdict {
        if self.is_too_young(candidate, now) {
            return Verdict::RejectAge;
        }
        if self.matching_pattern(&candidate.display_name).is_some() {
            return Verdict::RejectName;
        }
        Verdict::Admit
    }

    fn is_too_young(&self, candidate: &JoinCandidate, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(candidate.created_at) < self.min_account_age
    }

    /// First pattern (in listed order) hitting the lowercased name.
    pub fn matching_pattern(&self, display_name: &str) -> Option<&Regex> {
        let lowered = display_name.to_lowercase();
        self.name_patterns.iter().find(|re| re.is_match(&lowered))
    }

    /// Audit-log reason for a rejecting verdict.
    pub fn reason(&self, verdict: Verdict) -> Option<String> {
        match verdict {
            Verdict::Admit => None,
            Verdict::RejectAge => Some(format!(
                "[RaidProtect: Anti-Alts] account is younger than {} days",
                self.min_account_age.num_days()
            )),
            Verdict::RejectName => Some(
                "[RaidProtect: Name] name contains a suspicious keyword or advert".to_string(),
            ),
        }
    }
}
