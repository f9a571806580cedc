//! Data access agreement reconciler.
//!
//! Reads the agreements an administrative portal holds for a set of
//! institutions, writes them to an overview sheet for operators to annotate,
//! turns the annotations into deduplicated directives on a durable work queue,
//! and applies each directive to the portal with bounded retries. The crate
//! keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (data model, directive diffing,
//!   reference hashing, retry combinators). No I/O.
//! - **[`io`]**: Side-effecting operations (config, queue file, overview sheet,
//!   portal bindings, WebDriver client).
//!
//! Orchestration modules ([`overview`], [`upload`], [`handle`], [`process`])
//! coordinate core logic with I/O to implement the process modes.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod handle;
pub mod io;
pub mod logging;
pub mod overview;
pub mod process;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod upload;
