// Session management for cfs-local
// The protocol, sentinel and client modules are shared by the daemon and CLI binaries

pub mod backend;
pub mod client;
pub mod config;
pub mod daemon;
pub mod persistence;
pub mod protocol;
pub mod sentinel;
pub mod watcher;
pub mod worker;
