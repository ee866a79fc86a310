//! # Replica Testkit
//!
//! Test utilities for replica.
//!
//! This crate provides:
//! - In-process master/slave fixtures ([`ReplicaPair`])
//! - A loopback RPC client with failure injection and request hooks
//! - Property-based generators of write operations using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replica_testkit::prelude::*;
//!
//! #[test]
//! fn slave_catches_up() {
//!     let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
//!     pair.write_numbered("app", "c", 0, 10, 16);
//!     pair.sync().unwrap();
//!     assert!(pair.databases_match("app"));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clients;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clients::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use replica_master::MasterConfig;
}

pub use clients::*;
pub use fixtures::*;
pub use generators::*;
