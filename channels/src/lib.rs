//! Channel identity tracking
//!
//! Follows a channel from proposal through trusted (zero-confirmation)
//! funding to on-chain confirmation, reconciling the alias it was first
//! known by with its chain-anchored id and keeping every prior id
//! resolvable, including after close.
//!
//! ```text
//! daemon channel events --> ChannelEventPump --> ChannelIdentityResolver
//!                                 |                      ^
//!                                 v                      |
//!                         ChannelEventEmitter      resolve(id) from
//!                          (enriched events)        any caller
//! ```

pub mod allocator;
pub mod identity;
pub mod pump;
pub mod resolver;

pub use allocator::AliasAllocator;
pub use identity::{ChannelIdentity, EphemeralIds, IdentityState};
pub use pump::{
    ChannelEvent, ChannelEventEmitter, ChannelEventKind, ChannelEventPump, ResolvedChannelEvent,
};
pub use resolver::ChannelIdentityResolver;
