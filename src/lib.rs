//! Storefront checkout core
//!
//! Turns a cart or a buy-now item into an order and drives the three payment
//! rails: cash on delivery, bank transfer confirmed by polling, and card
//! payments through a signed gateway redirect.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod checkout;
pub mod config;
pub mod errors;
pub mod events;
pub mod payments;

pub use checkout::{CheckoutDeps, CheckoutOrchestrator, GatewayReturnHandler, PaymentMethod};
pub use config::{load_config, CheckoutConfig};
pub use errors::ServiceError;
