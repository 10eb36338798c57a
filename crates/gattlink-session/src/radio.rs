use std::sync::Arc;
use std::time::Duration;

use gattlink_transport::{BleHost, RadioLink, RadioTransport};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::Result;

/// An open radio link with its attached, powered host stack.
#[derive(Clone)]
pub(crate) struct Radio {
    pub(crate) link: Arc<dyn RadioLink>,
    pub(crate) host: Arc<dyn BleHost>,
}

impl Radio {
    pub(crate) async fn open(
        transport: &dyn RadioTransport,
        config: &SessionConfig,
    ) -> Result<Self> {
        let link = transport.open(&config.descriptor).await?;
        let host = link.attach(&config.device).await?;
        host.power_on().await?;
        info!(
            descriptor = %config.descriptor,
            address = %host.address(),
            name = %config.device.name,
            "radio powered on"
        );
        Ok(Self { link, host })
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.link.is_closed()
    }

    /// Detach the listener and close the link, waiting at most `bound`.
    pub(crate) async fn close(&self, bound: Duration) {
        self.host.set_listener(None);
        match tokio::time::timeout(bound, self.link.close()).await {
            Ok(Ok(())) => info!(descriptor = %self.link.descriptor(), "radio closed"),
            Ok(Err(err)) => warn!(%err, "radio close failed"),
            Err(_) => warn!(?bound, "radio did not close in time"),
        }
    }
}
