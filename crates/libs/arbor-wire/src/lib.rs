//! # arbor-wire
//!
//! Transport-agnostic message shape and code taxonomy for the arbor
//! exposition core.
//!
//! Every transport binding (HTTP, MQTT, WebSocket, in-process loopback)
//! carries the same logical message:
//!
//! ```text
//! { code, cid, adr?, data?, reply?, auth? }
//! ```
//!
//! `code` is either a request code ([`codes::REQUEST`], [`codes::EVENT`], …)
//! or a response code from the fixed taxonomy in [`codes`]. `cid` correlates
//! a response to its request. The shape must round-trip unchanged through
//! every supported codec; the serde derives here are the single source of
//! truth for that shape, and the codec round-trip tests live in
//! `tests/message_codec.rs`.

pub mod codes;
mod message;

pub use message::{Auth, Message};
