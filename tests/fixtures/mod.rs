//! Test fixtures

pub mod linked_taps;

pub use linked_taps::{LinkedTaps, eventually, retry, test_config};
