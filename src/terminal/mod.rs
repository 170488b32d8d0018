// ABOUTME: Terminal module for the session shell channel
// Wire protocol, directory confinement and the router that turns input lines into environment commands

pub mod policy;
pub mod protocol;
pub mod router;

pub use policy::{AccessPolicyError, DirectoryPolicy};
pub use protocol::{ClientEvent, ServerEvent, PROMPT};
pub use router::{CommandRouter, RouteOutcome};
