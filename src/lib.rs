#![deny(
    clippy::all,
    future_incompatible,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    rustdoc::broken_intra_doc_links,
    unsafe_code,
    unused
)]
#![allow(clippy::module_name_repetitions)]
#![doc = include_str!("../README.md")]

//! This crate is organized leaves-first, the way the component breakdown
//! it's grounded on lays things out: [`frame`] and [`ratelimit`] know
//! nothing above them, [`heartbeat`] and [`session`] sit above those,
//! [`fsm`] sequences the whole handshake and event loop over them, and
//! [`engine`] is the only module a typical caller touches directly.

pub mod close_codes;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod heartbeat;

mod frame;
mod json;
mod outbound;
mod ratelimit;
mod session;

pub use crate::{
    close_codes::CloseDisposition,
    command::{Command, IdentifyProperties},
    config::{Config, ConfigBuilder},
    engine::{GatewayEngine, Information},
    error::{FatalGatewayError, SendError, SendErrorType},
    fsm::Stage,
    heartbeat::Latency,
    ratelimit::RateLimiter,
};
