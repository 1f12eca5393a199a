//! Batch, incremental and single-message retrieval
//!
//! Every entry point borrows a [`ResilientConnection`](crate::connection::ResilientConnection),
//! so dropped sessions are repaired once before a failure is surfaced.

mod batch;
mod incremental;
mod lookup;

pub use batch::{
    Batch, BatchStream, DateRange, RawBatch, fetch_batches, fetch_most_recent, search_messages,
};
pub use incremental::fetch_incremental;
pub use lookup::fetch_message;
