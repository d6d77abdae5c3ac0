//! Time-series write fan-out: distributes each `(key, value, time)` observation to
//! every enabled backend (ASCII, Kafka/TSK, DBATS) without the producer needing to
//! know wire formats, batching rules, or connection semantics.
//!
//! The [`backend`] module holds the registry and the pluggable [`backend::Backend`]
//! trait; [`kp`] holds the Key Package, the columnar write buffer that amortises
//! per-key resolution across flushes; [`codec`] is the pure TSK wire codec.

pub mod backend;
pub mod codec;
pub mod error;
pub mod kp;
pub mod logging;
pub mod shell;
pub mod time;

pub use backend::{Backend, BackendId, Registry};
pub use error::{Result, TimeseriesError};
pub use kp::{KeyPackage, ResetMode};
