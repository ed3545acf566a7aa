//! Chat platform integrations for threadline
//!
//! A channel turns platform updates into [`InboundMessage`]s for the relay
//! and delivers replies, reporting the id the platform gave each one.
//!
//! [`InboundMessage`]: threadline_core::events::InboundMessage

pub mod base;
pub mod telegram;

pub use base::{AllowList, BaseChannel, ChannelError, ChannelHandler, ChannelHandlerPtr, Result};
pub use telegram::TelegramHandler;
