//! Core types and engine for threadline
//!
//! This crate holds the reply-chain threading engine (message store, session
//! index, context builder), the idle-session lifecycle manager, and the
//! shared plumbing used by every other threadline crate: configuration,
//! logging, errors, event types and the bounded retry combinator.

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod retry;
pub mod threading;
pub mod utils;

pub use error::{Error, Result};
pub use threading::{
    BackendContext, MessageId, Role, Route, SharedThreads, ThreadError, ThreadState,
    TranscriptEntry,
};
