//! Command dispatch: module name + command → bridge call.
//!
//! Resolves the module, refuses undeclared commands before anything is spawned,
//! attaches the caller's credentials and runs the bridge.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credentials;
use crate::bridge::protocol::{Args, DEFAULT_TIMEOUT_SECS, ModuleRequest, ModuleResponse};
use crate::executor::{BridgeError, ExecuteOptions, ModuleBridge, ProgressSink};
use crate::registry::{ModuleInfo, ModuleRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("module '{0}' not found")]
    ModuleNotFound(String),
    #[error("command '{command}' not available in module '{module}'")]
    CommandNotAvailable { module: String, command: String },
    #[error(transparent)]
    Registry(RegistryError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            Self::CommandNotAvailable { .. } => "COMMAND_NOT_AVAILABLE",
            Self::Registry(e) => e.code(),
            Self::Bridge(e) => e.code(),
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ModuleNotFound(name) => Self::ModuleNotFound(name),
            other => Self::Registry(other),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ModuleRegistry>,
    bridge: Arc<ModuleBridge>,
    credentials: Credentials,
    timeout_seconds: i64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        bridge: Arc<ModuleBridge>,
        credentials: Credentials,
    ) -> Self {
        Self {
            registry,
            bridge,
            credentials,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Timeout attached to requests built by this dispatcher, rounded up to
    /// whole seconds. Zero selects the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.timeout_seconds = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<ModuleBridge> {
        &self.bridge
    }

    /// Resolve the module and build the request, without running anything.
    pub fn prepare(
        &self,
        module: &str,
        command: &str,
        args: Args,
    ) -> Result<(ModuleInfo, ModuleRequest), DispatchError> {
        let info = self.registry.resolve(module)?;
        if !info.has_command(command) {
            return Err(DispatchError::CommandNotAvailable {
                module: module.to_string(),
                command: command.to_string(),
            });
        }
        let request = ModuleRequest::new(command)
            .with_args(args)
            .with_credentials(&self.credentials)
            .with_timeout_seconds(self.timeout_seconds);
        Ok((info, request))
    }

    pub async fn execute(
        &self,
        module: &str,
        command: &str,
        args: Args,
    ) -> Result<ModuleResponse, DispatchError> {
        self.execute_with(module, command, args, ExecuteOptions::default())
            .await
    }

    pub async fn execute_with_progress(
        &self,
        module: &str,
        command: &str,
        args: Args,
        sink: ProgressSink,
    ) -> Result<ModuleResponse, DispatchError> {
        self.execute_with(module, command, args, ExecuteOptions::new().with_progress(sink))
            .await
    }

    pub async fn execute_with(
        &self,
        module: &str,
        command: &str,
        args: Args,
        options: ExecuteOptions,
    ) -> Result<ModuleResponse, DispatchError> {
        let (info, request) = self.prepare(module, command, args)?;
        tracing::debug!(
            module,
            command,
            version = %info.manifest.version,
            entry_point = %info.entry_point.display(),
            "Dispatching module command"
        );
        Ok(self
            .bridge
            .execute_with(&info.entry_point, request, options)
            .await?)
    }
}
