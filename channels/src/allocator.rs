//! Alias id allocation

use lngate_core::ids::{alias_prefix_collides, is_chain_anchored};
use lngate_core::ChannelsConfig;

/// Hands out synthetic alias ids: fixed prefix plus a zero-padded counter
#[derive(Debug, Clone)]
pub struct AliasAllocator {
    prefix: String,
    width: usize,
    next: u64,
}

impl AliasAllocator {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
            next: 1,
        }
    }

    pub fn from_config(config: &ChannelsConfig) -> Self {
        if alias_prefix_collides(&config.alias_prefix, config.alias_counter_width) {
            tracing::warn!(
                prefix = %config.alias_prefix,
                "Alias prefix reads as a chain position, colliding counters are skipped"
            );
        }
        Self::new(config.alias_prefix.clone(), config.alias_counter_width)
    }

    /// Render the alias for a counter value
    pub fn format(&self, counter: u64) -> String {
        format!("{}{:0width$}", self.prefix, counter, width = self.width)
    }

    /// Allocate the next alias for which `taken` is false.
    ///
    /// Candidates that read as chain positions are never handed out.
    pub fn allocate(&mut self, taken: impl Fn(&str) -> bool) -> String {
        loop {
            let candidate = self.format(self.next);
            self.next += 1;
            if !taken(&candidate) && !is_chain_anchored(&candidate) {
                return candidate;
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for AliasAllocator {
    fn default() -> Self {
        Self::from_config(&ChannelsConfig::default())
    }
}
