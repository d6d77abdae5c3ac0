//! Library half of the `tsk-proxy` crate, split out from the binary so integration
//! tests under `tests/` can exercise the ingest pipeline directly instead of only
//! through the compiled binary — the same split the teacher's `authenticator` service
//! uses between its `core` module and its thin `main.rs`.

pub mod config;
pub mod proxy;
pub mod shutdown;
pub mod stats;
