use std::sync::Arc;

use crate::common::phys::Connector;
use crate::error::{RequestError, Shutdown};
use crate::retry::RetryStrategy;
use crate::server::task::SessionTask;

/// Serves the single session of a serial line, re-opening the port after failures
pub(crate) struct RtuServerTask {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) retry: Box<dyn RetryStrategy>,
    pub(crate) session: SessionTask,
}

impl RtuServerTask {
    pub(crate) async fn run(&mut self) -> Shutdown {
        loop {
            let opened = match self.session.open(self.connector.as_ref()).await {
                Ok(opened) => opened,
                Err(shutdown) => return shutdown,
            };
            let delay = match opened {
                Ok(phys) => {
                    self.retry.reset();
                    tracing::info!("serving {:?}", phys);
                    match self.session.run(phys).await {
                        RequestError::Shutdown => return Shutdown,
                        err => tracing::warn!("line failed: {}", err),
                    }
                    // a port that fails right after opening must not spin
                    self.retry.after_disconnect()
                }
                Err(err) => {
                    tracing::warn!("unable to open port: {}", err);
                    self.retry.after_failed_connect()
                }
            };

            tracing::info!("reopening port in {} ms", delay.as_millis());
            if let Err(shutdown) = self.session.sleep_for(delay).await {
                return shutdown;
            }
        }
    }
}
