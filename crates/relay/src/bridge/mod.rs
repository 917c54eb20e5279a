//! Framing and message types shared by the gateway, clients and workers.
//!
//! - **protocol**: Client commands, bounded messages, worker readiness events
//! - **codec**: Length-delimited codecs for raw messages and JSON events

pub mod codec;
pub mod protocol;
