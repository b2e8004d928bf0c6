//! Map Membership Module
//!
//! Tracks which peers take part in a given replicated map.
//!
//! ## Core Mechanisms
//! - **Handshake**: peers enter the table when they answer an INIT or announce a START.
//! - **Liveness**: each tracked peer carries a last-seen timestamp refreshed by ping replies.
//! - **Backup selection**: a round-robin cursor walks a sorted snapshot of the table.

pub mod tracker;
pub mod types;
