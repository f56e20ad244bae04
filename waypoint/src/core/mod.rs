//! Deterministic, pure logic shared by the substrate.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod build_state;
pub mod event;
pub mod fingerprint;
pub mod manifest;
pub mod policy;
pub mod types;
