use std::sync::Arc;

use crate::config::TransportConfig;
use crate::stats::TransportStats;

/// Everything that is shared by all channels of a single connection manager. It is created once
///  and cloned into each channel, so there is no process-wide state.
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<TransportConfig>,
    pub stats: Arc<TransportStats>,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> anyhow::Result<TransportContext> {
        config.validate()?;
        Ok(TransportContext {
            config: Arc::new(config),
            stats: Default::default(),
        })
    }
}
