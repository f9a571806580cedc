//! Deterministic, pure logic shared by the reconciler.
//!
//! Core modules are free of remote or filesystem side effects. They operate on
//! in-memory data and return deterministic outputs suitable for tests. The
//! only blocking they do is the inter-attempt sleep in [`retry`].

pub mod directives;
pub mod reference;
pub mod retry;
pub mod types;
