//! Observability setup shared by the chorus crates.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` with a configurable fallback level.
//! - **Tracing**: trace/span ID generation and operation spans so that one
//!   fan-out or batch run can be correlated across its concurrent tasks.

pub mod logging;
pub mod tracing_setup;
