//! Domain types - records, identifiers and configuration
//!
//! These types are shared by both ends of the coordination protocol and are
//! independent of the transport and storage backends.

pub mod config;
pub mod record;
