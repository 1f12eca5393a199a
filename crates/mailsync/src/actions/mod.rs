//! Message mutations
//!
//! Moves, flag changes and deletes against the live mailbox.

mod handler;

pub use handler::{ActionHandler, MoveOutcome, flags};
