//! walletgate: cross-context approval broker for a non-custodial wallet.
//!
//! Websites talk to the wallet through the gateway's bridge routes. Every
//! privileged request is parked in a durable single-slot-per-kind store,
//! shown on an approval surface, and answered once the operator decides,
//! the surface is closed, or the request times out.

pub mod bootstrap;
pub mod broker;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod settings;

pub use config::Config;
pub use error::{Error, Result};
