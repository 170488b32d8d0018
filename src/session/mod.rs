// ABOUTME: Session management for connected terminal clients
// A session binds one connection to a workspace, a working directory and an outbound event channel

pub mod table;

pub use table::{CommandSlot, EventSender, SessionEntry, SessionTable};
