//! Transport Factory
//!
//! Builds transport instances from a [`BridgeConfig`]. The Bridge calls this
//! once per strategy at construction; callers that want a single strategy
//! without the dispatcher can use it directly.

use std::sync::Arc;

use super::{
    ExecTransport, NamedPipeTransport, SharedVolumeTransport, SignalTransport, Strategy,
    TerminalTransport, Transport,
};
use crate::config::{BridgeConfig, ConfigError};
use crate::engine::ContainerEngine;

/// Create the transport implementing `strategy`
///
/// # Errors
///
/// Returns `ConfigError::Invalid` if the configuration cannot drive the
/// transport (currently only an unknown signal for [`Strategy::Signal`]).
///
/// # Example
///
/// ```ignore
/// let engine = Arc::new(DockerCli::default());
/// let pipe = create_transport(Strategy::NamedPipe, engine, &BridgeConfig::default())?;
/// pipe.send(&container, &envelope).await?;
/// ```
pub fn create_transport(
    strategy: Strategy,
    engine: Arc<dyn ContainerEngine>,
    config: &BridgeConfig,
) -> Result<Arc<dyn Transport>, ConfigError> {
    let transport: Arc<dyn Transport> = match strategy {
        Strategy::NamedPipe => Arc::new(NamedPipeTransport::new(engine, config)),
        Strategy::TerminalInjection => Arc::new(TerminalTransport::new(engine, config)),
        Strategy::Signal => Arc::new(SignalTransport::new(engine, config)?),
        Strategy::Exec => Arc::new(ExecTransport::new(engine, config)),
        Strategy::SharedVolume => Arc::new(SharedVolumeTransport::new(engine, config)),
    };
    Ok(transport)
}
