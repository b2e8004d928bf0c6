//! Client API Module
//!
//! JSON endpoints a node exposes to its clients on top of a replicated map.
//! Values travel as JSON strings so the handlers stay generic over the map's
//! value type.

pub mod handlers;
pub mod protocol;
