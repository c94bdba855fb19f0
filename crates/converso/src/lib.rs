//! converso: run out-of-process modules over a line-delimited JSON protocol.

mod version;

pub mod auth;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod job;
pub mod launcher;
pub mod registry;
pub mod status;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use auth::Credentials;
pub use bridge::codec::{ModuleLineCodec, decode_line, encode_request};
pub use bridge::protocol::{
    Args, ArgsExt, ModuleManifest, ModuleMessage, ModuleRequest, ModuleResponse, ProgressEvent,
    ProtocolError,
};
pub use config::Config;
pub use dispatch::{DispatchError, Dispatcher};
pub use executor::{BridgeError, CallId, ExecuteOptions, ModuleBridge, ProgressSink};
pub use job::{Job, JobError, JobStatus};
pub use launcher::{Launcher, ProcessLauncher};
pub use registry::{ModuleInfo, ModuleRegistry, RegistryError};
pub use status::{HttpJobApi, JobSource, StatusError, StatusSink};
pub use tokio_util::sync::CancellationToken;
pub use version::{CONVERSO_VERSION, VersionInfo, detect_interpreter_version};
pub use worker::{Worker, WorkerConfig, WorkerError};
