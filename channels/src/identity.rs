use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Channel identity lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    /// Alias allocated, channel not yet usable
    Proposed,
    /// Usable under its alias before any confirmation
    TrustedFunded,
    /// Known by a chain-anchored id
    Confirmed,
    /// Frozen; only queryable
    Closed,
}

impl std::fmt::Display for IdentityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityState::Proposed => write!(f, "proposed"),
            IdentityState::TrustedFunded => write!(f, "trusted_funded"),
            IdentityState::Confirmed => write!(f, "confirmed"),
            IdentityState::Closed => write!(f, "closed"),
        }
    }
}

/// Identifier history of one channel.
///
/// `current_id` never appears in `other_ids`; `other_ids` is in
/// chronological order with no duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub current_id: String,
    pub other_ids: Vec<String>,
    pub is_trusted_funding: bool,
    pub state: IdentityState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelIdentity {
    pub(crate) fn new(current_id: impl Into<String>, is_trusted_funding: bool, state: IdentityState) -> Self {
        let now = Utc::now();
        Self {
            current_id: current_id.into(),
            other_ids: Vec::new(),
            is_trusted_funding,
            state,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if `id` is the current id or any historical one
    pub fn knows(&self, id: &str) -> bool {
        self.current_id == id || self.other_ids.iter().any(|other| other == id)
    }

    /// Current id followed by history
    pub fn all_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.current_id.as_str()).chain(self.other_ids.iter().map(String::as_str))
    }

    pub fn is_closed(&self) -> bool {
        self.state == IdentityState::Closed
    }

    /// Append to history, skipping duplicates and the current id
    pub(crate) fn remember(&mut self, id: &str) {
        if id != self.current_id && !self.other_ids.iter().any(|other| other == id) {
            self.other_ids.push(id.to_string());
        }
    }

    /// Make `new_id` current, pushing the outgoing id onto history
    pub(crate) fn rename(&mut self, new_id: &str) {
        if self.current_id == new_id {
            return;
        }
        self.other_ids.retain(|other| other != new_id);
        let previous = std::mem::replace(&mut self.current_id, new_id.to_string());
        self.remember(&previous);
        self.updated_at = Utc::now();
    }
}

/// Aliases of one channel and the id it is referenced by now
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EphemeralIds {
    pub other_ids: Vec<String>,
    pub reference_id: String,
}
