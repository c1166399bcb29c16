//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and explicit timestamps and return deterministic outputs suitable for tests.

pub mod health;
pub mod schedule;
pub mod types;
pub mod window;
