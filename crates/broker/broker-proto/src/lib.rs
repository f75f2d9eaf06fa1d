//! Shared wire types for the wharf editor front end.
//!
//! The editor talks to the broker over a stream connection carrying one JSON
//! document per line. Each connection is one editing session.

#![warn(missing_docs)]

pub mod types;

pub use types::*;
