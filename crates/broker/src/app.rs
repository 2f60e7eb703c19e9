//! Application wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffSchedule;
use crate::config::DaemonArgs;
use crate::device_plugin::NfDevicePlugin;
use crate::registry::DeviceRegistry;
use crate::vendor::VendorClient;

/// Application core structure, owning the device plugin and its
/// cancellation scope.
pub struct Application {
    plugin: Arc<NfDevicePlugin>,
    token: CancellationToken,
}

impl Application {
    /// Builds the application components from the daemon arguments.
    pub fn new(args: &DaemonArgs) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let vendor = VendorClient::new(
            &args.vendor_socket_path,
            Duration::from_secs(args.discovery_timeout_secs),
        );

        let plugin = NfDevicePlugin::new(
            &args.plugin_dir,
            args.endpoint_file.clone(),
            args.resource_name.clone(),
            &args.kubelet_socket_path,
            registry,
            vendor,
            Duration::from_secs(args.health_poll_interval_secs),
            BackoffSchedule::default(),
        );

        Self {
            plugin,
            token: CancellationToken::new(),
        }
    }

    /// Runs the device-plugin session until the server task exits or a
    /// shutdown signal arrives, then tears down gracefully.
    pub async fn run(self) -> Result<()> {
        let mut server = self
            .plugin
            .start(self.token.clone())
            .await
            .context("device plugin startup failed")?;

        tokio::select! {
            result = &mut server => {
                match result {
                    Ok(()) => tracing::error!("Device plugin server task exited unexpectedly"),
                    Err(e) => tracing::error!("Device plugin server task panicked: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down...");
                self.token.cancel();
                let _ = server.await;
            }
        }

        self.plugin
            .shutdown()
            .context("device plugin shutdown failed")?;
        Ok(())
    }
}
