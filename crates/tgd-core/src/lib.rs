//! Update acquisition and dispatch engine for Telegram bots.
//!
//! This crate is transport-agnostic: the Bot API HTTP client and the webhook
//! server live in `tgd-http` and plug in through [`source::UpdateSource`] and
//! [`webhook::WebhookReceiver`].

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod filters;
pub mod logging;
pub mod offset;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod webhook;

pub use errors::{Error, Result};
