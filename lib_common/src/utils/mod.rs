//! # Utilities Module
//!
//! A collection point for the small, general-purpose helpers shared by the
//! `core` and `connections` folders of `lib_common`.
//!
//! ## Contained Modules:
//!
//! - **`misc`**: correlation id generation and the wall-clock helpers used to
//!   stamp updates and compose date/time based cache keys.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Miscellaneous utility functions: ids and time.
pub mod misc;
