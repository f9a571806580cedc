//! I/O helpers for reconciler commands.

pub mod atomic;
pub mod config;
pub mod portal;
pub mod queue;
pub mod schema;
pub mod sheet;
pub mod webdriver;
