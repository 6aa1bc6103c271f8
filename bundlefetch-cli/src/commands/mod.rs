//! CLI command implementations.

pub mod cancel;
pub mod common;
pub mod fetch;
pub mod manifest;
pub mod resume;
pub mod status;
pub mod storage;
