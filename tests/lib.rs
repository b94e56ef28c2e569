//! Shared fixtures for tapsock integration tests

pub mod fixtures;
