//! Wire contract between the CLI and module processes.
//!
//! # Architecture
//!
//! - **protocol**: Message types (ModuleRequest/Response, ProgressEvent, ModuleManifest)
//! - **codec**: Line-delimited JSON framing for child stdin/stdout

pub mod codec;
pub mod protocol;
