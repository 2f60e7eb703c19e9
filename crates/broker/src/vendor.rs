//! Client for the vendor device service, the source of truth for which
//! devices physically exist on this node.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::OnceCell;
use tonic::transport::Channel;
use tonic::Request;

use crate::error::PluginError;
use crate::uds;

pub mod api {
    tonic::include_proto!("vendor.v1");
}

use api::device_service_client::DeviceServiceClient;

/// Lazily connected, memoized client for the vendor's `DeviceService`.
///
/// The channel is dialed on first use and reused for the lifetime of the
/// process; there is no internal retry loop, the discovery caller owns
/// the retry cadence.
#[derive(Debug)]
pub struct VendorClient {
    socket_path: PathBuf,
    timeout: Duration,
    channel: OnceCell<Channel>,
}

impl VendorClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
            channel: OnceCell::new(),
        }
    }

    /// Enumerates the devices the vendor service knows about.
    ///
    /// The call is bounded by the configured discovery timeout so a
    /// stalled vendor peer cannot hang startup indefinitely.
    pub async fn get_devices(&self) -> Result<Vec<String>, PluginError> {
        let channel = self.connected().await?.clone();
        let mut client = DeviceServiceClient::new(channel);

        let response = tokio::time::timeout(
            self.timeout,
            client.get_devices(Request::new(api::Empty {})),
        )
        .await
        .map_err(|_| PluginError::DiscoveryTimeout {
            timeout: self.timeout,
        })?
        .map_err(|source| PluginError::Discovery { source })?;

        Ok(response
            .into_inner()
            .devices
            .into_iter()
            .map(|device| device.id)
            .collect())
    }

    async fn connected(&self) -> Result<&Channel, PluginError> {
        self.channel
            .get_or_try_init(|| async {
                tracing::info!(socket = %self.socket_path.display(), "Connecting to vendor device service");
                uds::channel(&self.socket_path)
                    .await
                    .map_err(|source| PluginError::Connection {
                        endpoint: self.socket_path.display().to_string(),
                        source,
                    })
            })
            .await
    }
}
