//! # Tally Client Library
//!
//! Client-side half of the counter synchronization core: the optimistic
//! reconciler queue and the HTTP transport it flushes through. The embedding
//! UI records local increments and renders `displayed()`; everything else
//! (batching, backoff, reconciliation against server truth) happens here.

pub mod queue;
pub mod transport;

pub use queue::ReconcilerQueue;
pub use transport::{HttpMergeTransport, MergeTransport, TransportError};
