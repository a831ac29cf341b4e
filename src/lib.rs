//! Oracle Node Library
//!
//! Off-chain oracle node: collects spot prices for a configured symbol set
//! from out-of-process provider plugins, aggregates them, and reports them to
//! the on-chain oracle contract through a commit-reveal voting protocol.

pub mod config;
pub mod plugins;
pub mod reporter;
pub mod server;
pub mod types;

pub use types::*;
