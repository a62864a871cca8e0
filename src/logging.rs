//! Thin wrapper around the `log` facade.
//!
//! No component owns or constructs its own logger; every layer logs through
//! the global facade with `log::trace!`/`debug!`/`warn!`/`error!`. Wiring an
//! actual subscriber (`env_logger`, `tracing-log`, …) is the embedder's job,
//! done once at process start — this module exists only to name the level
//! convention so every layer uses it consistently:
//!
//! - `trace!` — per-frame traffic, state transitions, reference-set flips.
//! - `debug!` — SETTINGS application, flow-control window changes.
//! - `warn!`  — tolerated anomalies: unknown frame types/SETTINGS IDs, unsolicited PONGs.
//! - `error!` — GOAWAY receipt, connection teardown.
//!
//! Each module imports the `log` macros it needs directly
//! (`use log::{trace, debug};`).

/// Install an `env_logger` subscriber suitable for `#[test]` functions.
///
/// Safe to call from many tests in the same binary: a logger already
/// installed by an earlier test is left in place rather than treated as an
/// error.
#[cfg(test)]
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
