//! proxywall - fail-closed iptables policy compiler
//!
//! Forces all traffic on a device through one local proxy (transparent TCP and
//! DNS ports) while admitting a small set of explicit exceptions: loopback,
//! the LAN, tethered clients, SIP, ADB, SSH, captive-portal sign-in and
//! per-application routing.
//!
//! # Architecture
//!
//! - [`core`] - Directive model, compiler, executor, lockdown protocol, intent layer
//! - [`audit`] - Audit log of every applied intent
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Settings persistence
//! - [`elevation`] - Privileged command channel
//! - [`utils`] - XDG directories, atomic writes, interface discovery
//!
//! # Safety Features
//!
//! - Default-deny before configuration, lock release strictly last
//! - Per-directive outcomes, no early abort
//! - State persisted only after a successful apply
//! - Input sanitization and validation before anything reaches argv
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{Firewall, Intent, Service};
