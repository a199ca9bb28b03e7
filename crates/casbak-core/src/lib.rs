pub mod addr;
pub mod attrs;
pub mod config;
pub mod error;
pub mod hash;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod plan;
pub mod run;
pub mod scan;
pub mod storage;

/// Test support: in-memory storage backends. Not part of the stable API.
pub mod testutil;
