//! Replicated Map Module
//!
//! A key/value map whose content is spread across every node that hosts a
//! map with the same name.
//!
//! ## Core Concepts
//! - **Roles**: for every key exactly one node is *primary* (authoritative),
//!   some nodes hold a *backup* replica and the rest hold a *proxy* that only
//!   knows where the value lives.
//! - **Strategies**: `Lazy` picks one round-robin backup per key, `Full`
//!   copies every entry to every member.
//! - **Membership**: each map tracks its own members. Joiners announce
//!   themselves with INIT/START, leavers with STOP, and a periodic ping expires
//!   members that went quiet.
//! - **Rebalancing**: when a member leaves, primaries re-publish the entries
//!   it was backing up and orphaned backups promote themselves.
//!
//! ## Layout
//! - **`replicated`**: the map type and its client operations.
//! - **`handler`**: inbound message and request processing.
//! - **`state`**: construction, join-time state transfer and shutdown.
//! - **`rebalance`**: membership arrival and departure handling.

pub mod config;
pub mod entry;
pub mod error;
pub mod handler;
pub mod message;
pub mod rebalance;
pub mod replicated;
pub mod state;
pub mod value;

#[cfg(test)]
mod tests;
