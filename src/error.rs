use serenity::all::ModelError;
use serenity::http::HttpError;
use thiserror::Error;

/// Discord's JSON error code for "Missing Permissions".
const MISSING_PERMISSIONS: isize = 50013;

/// Failure of an outbound guild action (kick, ban, guild edit, ...).
///
/// Callers log these and move on; nothing in the guards retries.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("missing permission to {action}")]
    PermissionDenied { action: &'static str },
    #[error("discord request failed: {0}")]
    Http(#[source] serenity::Error),
    #[error("{0}")]
    Other(String),
}

impl GuardError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, GuardError::PermissionDenied { .. })
    }

    /// Sorts a serenity error into "we lack privileges" vs. everything else.
    pub fn from_serenity(action: &'static str, err: serenity::Error) -> Self {
        let denied = match &err {
            serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => {
                resp.status_code.as_u16() == 403 || resp.error.code == MISSING_PERMISSIONS
            }
            serenity::Error::Model(ModelError::InvalidPermissions { .. }) => true,
            _ => false,
        };
        if denied {
            GuardError::PermissionDenied { action }
        } else {
            GuardError::Http(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_errors_are_not_permission_denied() {
        let err = GuardError::from_serenity("kick", serenity::Error::Other("boom"));
        assert!(!err.is_permission_denied());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn permission_denied_message_names_action() {
        let err = GuardError::PermissionDenied { action: "kick" };
        assert!(err.is_permission_denied());
        assert_eq!(err.to_string(), "missing permission to kick");
    }
}
