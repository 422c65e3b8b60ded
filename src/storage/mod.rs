//! Storage layer for the update log.
//!
//! Only directory-level concerns live here; the record file itself is
//! [`crate::update::log_file::TransactionLog`].

pub mod dir;

pub use dir::{LogDirectory, TLOG_DIR_NAME};
