//! A one-to-one realtime chat client.
//!
//! The [`engine`] ties together the session, the peer directory, history
//! loading, the live Socket.IO channel and the conversation synchronizer.
//! Renderers talk to it through [`ClientHandle`] and watch [`View`] snapshots.

pub mod api;
pub mod app;
pub mod channel;
pub mod directory;
pub mod engine;
mod error;
pub mod history;
pub mod session;
pub mod storage;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod testing;

pub use engine::{spawn, ClientHandle, View};
pub use error::{Error, Result, ValidationError};
