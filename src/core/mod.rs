//! Core policy logic
//!
//! Everything between an intent and the iptables processes that implement it:
//!
//! - [`directive`]: Typed filter operations and ordered rule sets
//! - [`capability`]: Optional-feature and IPv6 probing
//! - [`compiler`]: Pure translation of intents into rule sets
//! - [`executor`]: Sequential application with per-directive outcomes
//! - [`reconcile`]: Network-snapshot diffs
//! - [`lockdown`]: The default-deny state machine
//! - [`apps`]: Per-application rules and their provider
//! - [`firewall`]: The intent layer tying the above together
//! - [`error`]: Error types

pub mod apps;
pub mod capability;
pub mod compiler;
pub mod directive;
pub mod error;
pub mod executor;
pub mod firewall;
pub mod lockdown;
pub mod reconcile;

#[cfg(test)]
pub mod test_helpers;
