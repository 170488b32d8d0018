// ABOUTME: Library crate for sandbox-hub exposing the session manager components for the binary and tests

pub mod config;
pub mod docker;
pub mod files;
pub mod lifecycle;
pub mod server;
pub mod services;
pub mod session;
pub mod terminal;
pub mod watcher;
pub mod workspace;
