//! Device plugin for the kubelet.
//!
//! Owns the device-plugin session: stale-socket cleanup, vendor
//! discovery, serving the `DevicePlugin` protocol on a unix socket,
//! a self-test dial of that socket, and the one-shot registration
//! handshake with the kubelet.

pub mod api {
    tonic::include_proto!("v1beta1");
}

use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::RegisterRequest;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backoff::BackoffSchedule;
use crate::error::PluginError;
use crate::registry::DeviceRegistry;
use crate::uds;
use crate::vendor::VendorClient;

/// Device-plugin API version declared during registration.
pub const API_VERSION: &str = "v1beta1";

/// Env key carrying the comma-joined allocated device ids into the
/// workload's runtime environment.
pub const ALLOCATED_DEVICES_ENV: &str = "NF_DEV";

/// Network-function device plugin.
///
/// One instance drives one session with the kubelet; the registry it
/// carries is the only mutable state shared with the request handlers.
#[derive(Debug)]
pub struct NfDevicePlugin {
    /// Socket file name under the device-plugin directory, as announced
    /// to the kubelet.
    endpoint_file: String,
    /// Advertised resource name, e.g. "netfn.io/nf".
    resource_name: String,
    socket_path: PathBuf,
    kubelet_socket_path: PathBuf,
    options: DevicePluginOptions,
    registry: Arc<DeviceRegistry>,
    vendor: VendorClient,
    health_poll_interval: Duration,
    backoff: BackoffSchedule,
}

impl NfDevicePlugin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_dir: &Path,
        endpoint_file: impl Into<String>,
        resource_name: impl Into<String>,
        kubelet_socket_path: impl Into<PathBuf>,
        registry: Arc<DeviceRegistry>,
        vendor: VendorClient,
        health_poll_interval: Duration,
        backoff: BackoffSchedule,
    ) -> Arc<Self> {
        let endpoint_file = endpoint_file.into();
        let socket_path = plugin_dir.join(&endpoint_file);

        Arc::new(Self {
            endpoint_file,
            resource_name: resource_name.into(),
            socket_path,
            kubelet_socket_path: kubelet_socket_path.into(),
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
            registry,
            vendor,
            health_poll_interval,
            backoff,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs the ordered startup protocol. Every step is fatal on failure;
    /// there is no partial retry across steps.
    ///
    /// 1. remove any stale socket left by a previous run,
    /// 2. populate the registry from the vendor service,
    /// 3. bind the socket and serve the plugin protocol in the background,
    /// 4. dial the just-bound socket with bounded retries,
    /// 5. register the endpoint with the kubelet.
    ///
    /// Returns the server task handle; the server keeps serving until
    /// `token` is cancelled.
    pub async fn start(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, PluginError> {
        self.cleanup()?;

        let discovered = self.registry.refresh(&self.vendor).await?;
        info!(devices = discovered, "Device discovery completed");

        let server = self.serve(token)?;

        if let Err(e) = self.self_test().await {
            server.abort();
            return Err(e);
        }
        info!(
            resource = %self.resource_name,
            socket = %self.socket_path.display(),
            "Device plugin endpoint started serving"
        );

        if let Err(e) = self.register().await {
            server.abort();
            return Err(e);
        }
        info!(resource = %self.resource_name, "Device plugin registered with kubelet");

        Ok(server)
    }

    /// Removes a stale listening socket from a previous run. Absence is
    /// not an error.
    pub fn cleanup(&self) -> Result<(), PluginError> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {
                debug!(socket = %self.socket_path.display(), "Removed stale plugin socket");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Binds the plugin socket and serves the `DevicePlugin` protocol in
    /// a background task until `token` is cancelled.
    fn serve(self: &Arc<Self>, token: CancellationToken) -> Result<JoinHandle<()>, PluginError> {
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Device plugin server bound");

        let service = DevicePluginService {
            registry: self.registry.clone(),
            options: self.options.clone(),
            health_poll_interval: self.health_poll_interval,
            token: token.clone(),
        };

        let handle = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                        info!("Shutting down device plugin server");
                    },
                )
                .await;

            if let Err(e) = result {
                error!("Device plugin server failed: {e}");
            }
        });

        Ok(handle)
    }

    /// Dials the just-bound plugin socket to confirm it accepts
    /// connections before announcing it to the kubelet.
    async fn self_test(&self) -> Result<(), PluginError> {
        let channel = connect_with_retry(&self.socket_path, &self.backoff).await?;
        drop(channel);
        Ok(())
    }

    /// One-shot registration handshake declaring this endpoint and the
    /// advertised resource name.
    async fn register(&self) -> Result<(), PluginError> {
        let channel = uds::channel(&self.kubelet_socket_path)
            .await
            .map_err(|source| PluginError::Connection {
                endpoint: self.kubelet_socket_path.display().to_string(),
                source,
            })?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint_file.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(self.options.clone()),
        };

        client
            .register(Request::new(request))
            .await
            .map_err(|source| PluginError::Registration {
                resource: self.resource_name.clone(),
                source,
            })?;

        Ok(())
    }

    /// Releases the listening socket and drops all registry state. The
    /// server task itself stops when the cancellation token fires.
    pub fn shutdown(&self) -> Result<(), PluginError> {
        self.cleanup()?;
        self.registry.clear();
        info!(resource = %self.resource_name, "Device plugin shut down");
        Ok(())
    }
}

/// Dials the unix socket at `socket_path`, retrying unavailable peers
/// with bounded exponential backoff. Blocks until connected or the
/// attempt/time budget is spent.
pub async fn connect_with_retry(
    socket_path: &Path,
    schedule: &BackoffSchedule,
) -> Result<Channel, PluginError> {
    let dial = async {
        let mut last_error = None;

        for attempt in 0..schedule.max_attempts {
            match uds::channel(socket_path).await {
                Ok(channel) => return Ok(channel),
                // A connect failure is the "temporarily unavailable"
                // condition; anything the peer answers is not retried.
                Err(e) => {
                    debug!(
                        socket = %socket_path.display(),
                        attempt,
                        error = %e,
                        "Self-test dial failed"
                    );
                    last_error = Some(e);
                }
            }
            tokio::time::sleep(schedule.delay_for_attempt(attempt)).await;
        }

        Err(match last_error {
            Some(source) => PluginError::Connection {
                endpoint: socket_path.display().to_string(),
                source,
            },
            None => PluginError::SelfTestExhausted {
                endpoint: socket_path.display().to_string(),
                attempts: schedule.max_attempts,
            },
        })
    };

    match tokio::time::timeout(schedule.overall_timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(PluginError::SelfTestExhausted {
            endpoint: socket_path.display().to_string(),
            attempts: schedule.max_attempts,
        }),
    }
}

/// `DevicePlugin` service implementation serving the kubelet's calls
/// against the shared device registry.
#[derive(Debug)]
pub struct DevicePluginService {
    registry: Arc<DeviceRegistry>,
    options: DevicePluginOptions,
    health_poll_interval: Duration,
    /// Parent scope for per-stream watch loops; cancelling it tears down
    /// every open stream along with the server.
    token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        health_poll_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
            health_poll_interval,
            token,
        }
    }

    fn inventory(registry: &DeviceRegistry) -> ListAndWatchResponse {
        ListAndWatchResponse {
            devices: registry
                .snapshot()
                .into_iter()
                .map(|record| api::Device {
                    id: record.id,
                    health: record.health.as_str().to_string(),
                })
                .collect(),
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("Reporting device plugin options");
        Ok(Response::new(self.options.clone()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Serves one list-and-watch stream: push the full inventory, then
    /// poll the registry's health check and push again on every change.
    ///
    /// The loop is scoped to this stream. A failed push means the caller
    /// went away and terminates only this loop; the shared server keeps
    /// serving other streams.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("Starting list-and-watch stream");

        let (tx, rx) = mpsc::unbounded_channel();
        let registry = self.registry.clone();
        let interval = self.health_poll_interval;
        let stream_token = self.token.child_token();

        tokio::spawn(async move {
            let mut dirty = true;
            loop {
                if dirty {
                    let response = Self::inventory(&registry);
                    debug!(devices = response.devices.len(), "Pushing device inventory");
                    if tx.send(Ok(response)).is_err() {
                        warn!("List-and-watch stream closed by peer");
                        break;
                    }
                    dirty = false;
                }

                tokio::select! {
                    _ = stream_token.cancelled() => {
                        info!("List-and-watch stream cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        dirty = registry.health_check();
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// Binds the requested device ids to a workload instance by handing
    /// them over as environment data. Stateless: nothing is marked as in
    /// use, so idempotent callers get the same answer while health is
    /// unchanged.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        let mut container_responses = Vec::with_capacity(request.container_requests.len());

        for container in &request.container_requests {
            let mut allocated = String::new();

            for id in &container.devices_ids {
                match self.registry.health_of(id) {
                    None => {
                        return Err(PluginError::UnknownDevice { id: id.clone() }.into());
                    }
                    Some(health) if health != crate::registry::DeviceHealth::Healthy => {
                        return Err(PluginError::UnhealthyDevice { id: id.clone() }.into());
                    }
                    Some(_) => {
                        allocated.push_str(id);
                        allocated.push(',');
                    }
                }
            }

            info!(devices = %allocated, "Devices allocated");

            let envs = std::collections::HashMap::from([(
                ALLOCATED_DEVICES_ENV.to_string(),
                allocated,
            )]);
            container_responses.push(ContainerAllocateResponse { envs });
        }

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("Pre-start container hook invoked");
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
