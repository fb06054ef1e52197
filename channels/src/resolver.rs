//! Channel identity resolver
//!
//! Maps every id a channel has ever had (current and historical) to one
//! identity record. All mutation happens under a single write lock, so a
//! rename is observed by readers either entirely before or entirely after.

use chrono::Utc;
use lngate_core::ids::is_chain_anchored;
use lngate_core::{ChannelsConfig, GateError, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::allocator::AliasAllocator;
use crate::identity::{ChannelIdentity, EphemeralIds, IdentityState};

type IdentityKey = u64;

struct ResolverState {
    records: HashMap<IdentityKey, ChannelIdentity>,
    /// Every known id, current or historical, to its record
    index: HashMap<String, IdentityKey>,
    /// Closed records in close order
    closed: VecDeque<IdentityKey>,
    allocator: AliasAllocator,
    next_key: IdentityKey,
}

impl ResolverState {
    fn insert(&mut self, identity: ChannelIdentity) -> IdentityKey {
        let key = self.next_key;
        self.next_key += 1;
        for id in identity.all_ids() {
            self.index.insert(id.to_string(), key);
        }
        self.records.insert(key, identity);
        key
    }

    fn key_of(&self, id: &str) -> Option<IdentityKey> {
        self.index.get(id).copied()
    }

    fn record(&self, key: IdentityKey) -> Option<&ChannelIdentity> {
        self.records.get(&key)
    }

    /// Rename record `key` to `new_id`, keeping the index in step
    fn rename(&mut self, key: IdentityKey, new_id: &str) -> Result<()> {
        if let Some(owner) = self.key_of(new_id) {
            if owner != key {
                return Err(GateError::validation(
                    "permanent_id",
                    format!("{} already identifies another channel", new_id),
                ));
            }
        }

        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| GateError::UnknownIdentity(new_id.to_string()))?;
        record.rename(new_id);
        self.index.insert(new_id.to_string(), key);
        Ok(())
    }

    /// Key of the open record known by `id`
    fn open_key(&self, id: &str, unknown: fn(String) -> GateError) -> Result<IdentityKey> {
        let key = self.key_of(id).ok_or_else(|| unknown(id.to_string()))?;
        match self.record(key) {
            Some(record) if record.is_closed() => Err(GateError::IdentityClosed(id.to_string())),
            Some(_) => Ok(key),
            None => Err(unknown(id.to_string())),
        }
    }

    /// Proposed moves to TrustedFunded; later states are kept
    fn fund(&mut self, key: IdentityKey) -> Option<ChannelIdentity> {
        let record = self.records.get_mut(&key)?;
        if record.state == IdentityState::Proposed {
            record.state = IdentityState::TrustedFunded;
            record.updated_at = Utc::now();
        }
        Some(record.clone())
    }

    /// Make `permanent_id` current and mark the record Confirmed
    fn confirm(&mut self, key: IdentityKey, permanent_id: &str) -> Result<ChannelIdentity> {
        let previous = self
            .record(key)
            .map(|record| record.current_id.clone())
            .ok_or_else(|| GateError::UnknownIdentity(permanent_id.to_string()))?;

        self.rename(key, permanent_id)?;

        let record = self
            .records
            .get_mut(&key)
            .ok_or_else(|| GateError::UnknownIdentity(permanent_id.to_string()))?;
        record.state = IdentityState::Confirmed;
        record.updated_at = Utc::now();

        if previous != permanent_id {
            tracing::info!(
                from = %previous,
                to = %permanent_id,
                history = record.other_ids.len(),
                "Channel identity confirmed"
            );
        }
        Ok(record.clone())
    }

    /// Adopt ids from `other_ids` that no record claims yet
    fn merge_history(&mut self, key: IdentityKey, other_ids: &[String]) {
        for other in other_ids {
            if self.key_of(other).is_some() {
                continue;
            }
            if let Some(record) = self.records.get_mut(&key) {
                record.remember(other);
            }
            self.index.insert(other.clone(), key);
        }
    }

    fn evict_over(&mut self, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.closed.len() > limit {
            let Some(key) = self.closed.pop_front() else {
                break;
            };
            if let Some(record) = self.records.remove(&key) {
                for id in record.all_ids() {
                    self.index.remove(id);
                }
                tracing::debug!(channel = %record.current_id, "Evicted closed channel identity");
            }
        }
    }
}

/// Channel identity resolver
pub struct ChannelIdentityResolver {
    state: RwLock<ResolverState>,
    archive_limit: usize,
}

impl ChannelIdentityResolver {
    /// Create a new resolver
    pub fn new(config: &ChannelsConfig) -> Self {
        Self {
            state: RwLock::new(ResolverState {
                records: HashMap::new(),
                index: HashMap::new(),
                closed: VecDeque::new(),
                allocator: AliasAllocator::from_config(config),
                next_key: 0,
            }),
            archive_limit: config.archive_limit,
        }
    }

    /// Allocate an alias for a trusted-funding open.
    ///
    /// Returns `None` for ordinary opens: those only become known once the
    /// daemon reports them with a chain-anchored id.
    pub fn propose(&self, is_trusted_funding: bool) -> Option<String> {
        if !is_trusted_funding {
            return None;
        }

        let mut state = self.state.write();
        let alias = {
            let ResolverState {
                index, allocator, ..
            } = &mut *state;
            allocator.allocate(|candidate| index.contains_key(candidate))
        };
        state.insert(ChannelIdentity::new(
            alias.clone(),
            true,
            IdentityState::TrustedFunded,
        ));

        tracing::info!(alias = %alias, "Proposed trusted-funding channel");
        Some(alias)
    }

    /// Channel became usable under its alias
    pub fn mark_funded(&self, alias_id: &str) -> Result<ChannelIdentity> {
        let mut state = self.state.write();
        let key = state.open_key(alias_id, GateError::UnknownAlias)?;
        state
            .fund(key)
            .ok_or_else(|| GateError::UnknownAlias(alias_id.to_string()))
    }

    /// Funding confirmed: `permanent_id` becomes current, `alias_id` history.
    ///
    /// Also covers re-confirmation after a reorg, where `alias_id` is the
    /// previous permanent id (or any id the channel ever had).
    pub fn on_confirmed(&self, alias_id: &str, permanent_id: &str) -> Result<ChannelIdentity> {
        if permanent_id.is_empty() {
            return Err(GateError::validation("permanent_id", "must not be empty"));
        }

        let mut state = self.state.write();
        let key = state.open_key(alias_id, GateError::UnknownAlias)?;
        state.confirm(key, permanent_id)
    }

    /// Close the identity known by `id` (current or historical).
    ///
    /// Returns the full record so close observers see every id.
    pub fn on_closed(&self, id: &str) -> Result<ChannelIdentity> {
        let mut state = self.state.write();
        let key = state
            .key_of(id)
            .ok_or_else(|| GateError::UnknownIdentity(id.to_string()))?;
        let record = state
            .records
            .get_mut(&key)
            .ok_or_else(|| GateError::UnknownIdentity(id.to_string()))?;

        if record.is_closed() {
            return Ok(record.clone());
        }

        record.state = IdentityState::Closed;
        record.updated_at = Utc::now();
        let snapshot = record.clone();

        state.closed.push_back(key);
        state.evict_over(self.archive_limit);

        tracing::info!(
            channel = %snapshot.current_id,
            other_ids = ?snapshot.other_ids,
            "Channel identity closed"
        );
        Ok(snapshot)
    }

    /// Look up by current or historical id
    pub fn resolve(&self, id: &str) -> Result<ChannelIdentity> {
        let state = self.state.read();
        state
            .key_of(id)
            .and_then(|key| state.record(key))
            .cloned()
            .ok_or_else(|| GateError::UnknownIdentity(id.to_string()))
    }

    /// Record a channel the daemon reports as open.
    ///
    /// A known id (or known alias in `other_ids`) updates that identity; a
    /// chain-anchored id differing from the current one is a confirmation.
    /// Unknown channels are created, Confirmed when `id` is chain-anchored.
    pub fn observe_opened(
        &self,
        id: &str,
        other_ids: &[String],
        is_trusted_funding: bool,
    ) -> Result<ChannelIdentity> {
        let mut state = self.state.write();

        let existing = std::iter::once(id)
            .chain(other_ids.iter().map(String::as_str))
            .find_map(|candidate| state.key_of(candidate).map(|key| (candidate, key)));

        let Some((known_by, key)) = existing else {
            let lifecycle = if is_chain_anchored(id) {
                IdentityState::Confirmed
            } else {
                IdentityState::TrustedFunded
            };
            let mut identity = ChannelIdentity::new(id, is_trusted_funding, lifecycle);
            for other in other_ids {
                if state.key_of(other).is_none() {
                    identity.remember(other);
                }
            }
            let snapshot = identity.clone();
            state.insert(identity);

            tracing::debug!(channel = %id, state = %lifecycle, "Observed new channel");
            return Ok(snapshot);
        };

        let (current_id, closed, knows_id) = state
            .record(key)
            .map(|record| (record.current_id.clone(), record.is_closed(), record.knows(id)))
            .ok_or_else(|| GateError::UnknownIdentity(known_by.to_string()))?;
        if closed {
            return Err(GateError::IdentityClosed(known_by.to_string()));
        }

        // an id the channel already moved past is a stale report
        if current_id == id {
            state.fund(key);
        } else if !knows_id && is_chain_anchored(id) {
            state.confirm(key, id)?;
        } else if !knows_id {
            state.rename(key, id)?;
        }

        state.merge_history(key, other_ids);
        state
            .record(key)
            .cloned()
            .ok_or_else(|| GateError::UnknownIdentity(id.to_string()))
    }

    /// Every channel that ever had an alias, with the id it goes by now
    pub fn ephemeral_ids(&self) -> Vec<EphemeralIds> {
        let state = self.state.read();
        let mut keys: Vec<&IdentityKey> = state.records.keys().collect();
        keys.sort();

        keys.into_iter()
            .filter_map(|key| state.records.get(key))
            .filter_map(|record| {
                let aliases: Vec<String> = record
                    .all_ids()
                    .filter(|id| !is_chain_anchored(id))
                    .map(str::to_string)
                    .collect();
                if aliases.is_empty() {
                    None
                } else {
                    Some(EphemeralIds {
                        other_ids: aliases,
                        reference_id: record.current_id.clone(),
                    })
                }
            })
            .collect()
    }

    /// Closed identities in close order
    pub fn closed_channels(&self) -> Vec<ChannelIdentity> {
        let state = self.state.read();
        state
            .closed
            .iter()
            .filter_map(|key| state.record(*key))
            .cloned()
            .collect()
    }

    /// Number of tracked identities, closed included
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelIdentityResolver {
    fn default() -> Self {
        Self::new(&ChannelsConfig::default())
    }
}
