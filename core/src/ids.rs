//! Channel identifier formats.
//!
//! Chain-anchored ids render as `<block_height>x<tx_index>x<output_index>`.
//! Alias ids live in a block-height range no chain will reach for centuries,
//! so an alias can never collide with a real funding position.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::GateError;

/// First block height of the synthetic alias range
pub const ALIAS_BLOCK_HEIGHT_START: u32 = 16_000_000;

/// Last block height of the synthetic alias range
pub const ALIAS_BLOCK_HEIGHT_END: u32 = 16_250_000;

/// Position of a funding output on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortChannelId {
    pub block_height: u32,
    pub tx_index: u32,
    pub output_index: u16,
}

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        Self {
            block_height,
            tx_index,
            output_index,
        }
    }

    /// Decode the daemon's packed 64-bit form
    pub fn from_u64(value: u64) -> Self {
        Self {
            block_height: (value >> 40) as u32,
            tx_index: ((value >> 16) & 0xFF_FFFF) as u32,
            output_index: (value & 0xFFFF) as u16,
        }
    }

    /// Pack into the daemon's 64-bit form
    pub fn to_u64(self) -> u64 {
        ((self.block_height as u64) << 40)
            | (((self.tx_index as u64) & 0xFF_FFFF) << 16)
            | self.output_index as u64
    }

    /// Height falls inside the synthetic alias range
    pub fn is_alias(&self) -> bool {
        (ALIAS_BLOCK_HEIGHT_START..ALIAS_BLOCK_HEIGHT_END).contains(&self.block_height)
    }
}

impl std::fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.block_height, self.tx_index, self.output_index)
    }
}

impl FromStr for ShortChannelId {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('x').collect();
        if parts.len() != 3 {
            return Err(GateError::validation("channel_id", format!("expected AxBxC, got '{}'", s)));
        }

        let block_height = parts[0]
            .parse::<u32>()
            .map_err(|_| GateError::validation("channel_id", format!("bad block height in '{}'", s)))?;
        let tx_index = parts[1]
            .parse::<u32>()
            .ok()
            .filter(|v| *v <= 0xFF_FFFF)
            .ok_or_else(|| GateError::validation("channel_id", format!("bad tx index in '{}'", s)))?;
        let output_index = parts[2]
            .parse::<u16>()
            .map_err(|_| GateError::validation("channel_id", format!("bad output index in '{}'", s)))?;

        Ok(Self::new(block_height, tx_index, output_index))
    }
}

/// True when `id` parses as a real chain position
pub fn is_chain_anchored(id: &str) -> bool {
    id.parse::<ShortChannelId>()
        .map(|scid| !scid.is_alias())
        .unwrap_or(false)
}

/// True when aliases built from `prefix` would read as chain positions.
///
/// The counter only extends the last segment, so counter 1 decides it.
pub fn alias_prefix_collides(prefix: &str, width: usize) -> bool {
    is_chain_anchored(&format!("{}{:0width$}", prefix, 1, width = width))
}
