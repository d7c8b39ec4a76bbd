//! Shared cross-platform state types.

use serde::Serialize;

/// Coarse sync state reported by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    /// Derive the state from the driver flags. An in-flight cycle reports `Syncing`
    /// even after the device has gone offline.
    pub const fn derive(is_online: bool, is_syncing: bool, last_cycle_failed: bool) -> Self {
        if is_syncing {
            Self::Syncing
        } else if !is_online {
            Self::Offline
        } else if last_cycle_failed {
            Self::Error
        } else {
            Self::Synced
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syncing_takes_precedence_over_offline() {
        assert_eq!(SyncState::derive(false, true, false), SyncState::Syncing);
        assert_eq!(SyncState::derive(false, false, true), SyncState::Offline);
        assert_eq!(SyncState::derive(true, false, true), SyncState::Error);
        assert_eq!(SyncState::derive(true, false, false), SyncState::Synced);
    }
}
