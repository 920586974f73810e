//! # tilth-bus
//!
//! Fact messages and the plumbing that carries them to the scheduler.
//!
//! ## Messages
//!
//! A [`Message`] is a flat string map tagged with the id of the source that
//! produced it. An *empty* message (no payload) means "nothing known", which
//! is different from a message with an empty map. Two messages are equal iff
//! their payloads are equal; the id is ignored.
//!
//! ## Pipes
//!
//! [`StrictPipe`] merges several sources into one message and only forwards
//! facts once every declared source has reported.

mod message;
mod pipe;

pub use message::{Consumer, Message, RecordingConsumer};
pub use pipe::StrictPipe;
