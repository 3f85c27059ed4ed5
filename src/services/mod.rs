//! Chat services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own presence, fan-out and persistence so the websocket
//! handler can stay focused on protocol translation.

pub mod heartbeat;
pub mod hub;
pub mod presence;
pub mod session;
pub mod store;
