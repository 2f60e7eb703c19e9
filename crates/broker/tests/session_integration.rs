//! Full device-plugin session tests over real unix-domain-socket
//! channels: a fake vendor service and a fake kubelet registration
//! server on one side, the broker on the other.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::time::timeout;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::Request;
use tonic::Response;
use tonic::Status;

use nf_device_broker::device_plugin::api as plugin_api;
use nf_device_broker::device_plugin::api::device_plugin_client::DevicePluginClient;
use nf_device_broker::device_plugin::api::registration_server::Registration;
use nf_device_broker::device_plugin::api::registration_server::RegistrationServer;
use nf_device_broker::device_plugin::ALLOCATED_DEVICES_ENV;
use nf_device_broker::device_plugin::API_VERSION;
use nf_device_broker::vendor::api as vendor_api;
use nf_device_broker::vendor::api::device_service_server::DeviceService;
use nf_device_broker::vendor::api::device_service_server::DeviceServiceServer;
use nf_device_broker::BackoffSchedule;
use nf_device_broker::DeviceHealth;
use nf_device_broker::DeviceRegistry;
use nf_device_broker::NfDevicePlugin;
use nf_device_broker::VendorClient;

struct FakeVendor {
    ids: Vec<String>,
}

#[tonic::async_trait]
impl DeviceService for FakeVendor {
    async fn get_devices(
        &self,
        _request: Request<vendor_api::Empty>,
    ) -> Result<Response<vendor_api::DeviceList>, Status> {
        Ok(Response::new(vendor_api::DeviceList {
            devices: self
                .ids
                .iter()
                .map(|id| vendor_api::Device { id: id.clone() })
                .collect(),
        }))
    }
}

#[derive(Default)]
struct FakeKubelet {
    seen: Arc<Mutex<Option<plugin_api::RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<plugin_api::RegisterRequest>,
    ) -> Result<Response<plugin_api::Empty>, Status> {
        *self.seen.lock().unwrap() = Some(request.into_inner());
        Ok(Response::new(plugin_api::Empty {}))
    }
}

fn fast_backoff() -> BackoffSchedule {
    BackoffSchedule {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        max_attempts: 40,
        overall_timeout: Duration::from_secs(5),
    }
}

fn start_fake_vendor(socket_path: &Path, ids: &[&str]) {
    let service = FakeVendor {
        ids: ids.iter().map(|s| s.to_string()).collect(),
    };
    let listener = UnixListener::bind(socket_path).unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(DeviceServiceServer::new(service))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .ok();
    });
}

fn start_fake_kubelet(socket_path: &Path) -> Arc<Mutex<Option<plugin_api::RegisterRequest>>> {
    let kubelet = FakeKubelet::default();
    let seen = kubelet.seen.clone();
    let listener = UnixListener::bind(socket_path).unwrap();
    tokio::spawn(async move {
        Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .ok();
    });
    seen
}

struct Session {
    plugin: Arc<NfDevicePlugin>,
    token: CancellationToken,
    seen: Arc<Mutex<Option<plugin_api::RegisterRequest>>>,
    _dir: tempfile::TempDir,
}

async fn start_session(devices: &[&str]) -> (Session, tokio::task::JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let vendor_socket = dir.path().join("vendor.sock");
    let kubelet_socket = dir.path().join("kubelet.sock");

    start_fake_vendor(&vendor_socket, devices);
    let seen = start_fake_kubelet(&kubelet_socket);

    let plugin = NfDevicePlugin::new(
        dir.path(),
        "nf-net.sock",
        "netfn.io/nf",
        kubelet_socket,
        Arc::new(DeviceRegistry::new()),
        VendorClient::new(vendor_socket, Duration::from_secs(2)),
        Duration::from_millis(30),
        fast_backoff(),
    );

    let token = CancellationToken::new();
    let server = plugin.start(token.clone()).await.unwrap();

    (
        Session {
            plugin,
            token,
            seen,
            _dir: dir,
        },
        server,
    )
}

async fn plugin_client(socket_path: PathBuf) -> DevicePluginClient<tonic::transport::Channel> {
    let channel = nf_device_broker::uds::channel(&socket_path).await.unwrap();
    DevicePluginClient::new(channel)
}

#[tokio::test]
async fn test_startup_registers_endpoint_with_kubelet() {
    let (session, _server) = start_session(&["nf-0", "nf-1"]).await;

    let seen = session.seen.lock().unwrap().clone();
    let request = seen.expect("kubelet should have seen a registration");
    assert_eq!(request.version, API_VERSION);
    assert_eq!(request.endpoint, "nf-net.sock");
    assert_eq!(request.resource_name, "netfn.io/nf");
    let options = request.options.expect("options should be declared");
    assert!(!options.pre_start_required);
}

#[tokio::test]
async fn test_watch_and_allocate_over_real_channel() {
    let (session, _server) = start_session(&["nf-0", "nf-1"]).await;
    let mut client = plugin_client(session.plugin.socket_path().to_path_buf()).await;

    // First push carries the full inventory.
    let mut stream = client
        .list_and_watch(plugin_api::Empty {})
        .await
        .unwrap()
        .into_inner();
    let first = timeout(Duration::from_secs(2), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.devices.len(), 2);
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    // Allocation of a known healthy device hands it over as env data.
    let response = client
        .allocate(plugin_api::AllocateRequest {
            container_requests: vec![plugin_api::ContainerAllocateRequest {
                devices_ids: vec!["nf-0".to_string()],
            }],
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        response.container_responses[0].envs[ALLOCATED_DEVICES_ENV],
        "nf-0,"
    );

    // Unknown devices fail the whole request.
    let status = client
        .allocate(plugin_api::AllocateRequest {
            container_requests: vec![plugin_api::ContainerAllocateRequest {
                devices_ids: vec!["ghost".to_string()],
            }],
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
    assert!(status.message().contains("unknown device: ghost"));
}

#[tokio::test]
async fn test_health_change_triggers_second_push() {
    let (session, _server) = start_session(&["nf-0"]).await;
    let mut client = plugin_client(session.plugin.socket_path().to_path_buf()).await;

    let mut stream = client
        .list_and_watch(plugin_api::Empty {})
        .await
        .unwrap()
        .into_inner();
    timeout(Duration::from_secs(2), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    session
        .plugin
        .registry()
        .set_health("nf-0", DeviceHealth::Unhealthy);

    let second = timeout(Duration::from_secs(2), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.devices.len(), 1);
}

#[tokio::test]
async fn test_empty_discovery_still_completes_startup() {
    let (session, _server) = start_session(&[]).await;

    assert!(session.plugin.registry().is_empty());
    assert!(session.seen.lock().unwrap().is_some());

    let mut client = plugin_client(session.plugin.socket_path().to_path_buf()).await;
    let options = client
        .get_device_plugin_options(plugin_api::Empty {})
        .await
        .unwrap()
        .into_inner();
    assert!(!options.pre_start_required);
}

#[tokio::test]
async fn test_stale_socket_is_cleaned_up_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let vendor_socket = dir.path().join("vendor.sock");
    let kubelet_socket = dir.path().join("kubelet.sock");
    start_fake_vendor(&vendor_socket, &["nf-0"]);
    start_fake_kubelet(&kubelet_socket);

    // Leftover artifact from a "previous run".
    std::fs::write(dir.path().join("nf-net.sock"), b"stale").unwrap();

    let plugin = NfDevicePlugin::new(
        dir.path(),
        "nf-net.sock",
        "netfn.io/nf",
        kubelet_socket,
        Arc::new(DeviceRegistry::new()),
        VendorClient::new(vendor_socket, Duration::from_secs(2)),
        Duration::from_millis(30),
        fast_backoff(),
    );

    let token = CancellationToken::new();
    let server = plugin.start(token.clone()).await.unwrap();

    token.cancel();
    let _ = server.await;
}

#[tokio::test]
async fn test_startup_fails_without_vendor_service() {
    let dir = tempfile::tempdir().unwrap();
    let kubelet_socket = dir.path().join("kubelet.sock");
    start_fake_kubelet(&kubelet_socket);

    let plugin = NfDevicePlugin::new(
        dir.path(),
        "nf-net.sock",
        "netfn.io/nf",
        kubelet_socket,
        Arc::new(DeviceRegistry::new()),
        VendorClient::new(dir.path().join("missing-vendor.sock"), Duration::from_secs(2)),
        Duration::from_millis(30),
        fast_backoff(),
    );

    let err = plugin.start(CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(err, nf_device_broker::PluginError::Connection { .. }),
        "{err}"
    );
}

#[tokio::test]
async fn test_startup_fails_without_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let vendor_socket = dir.path().join("vendor.sock");
    start_fake_vendor(&vendor_socket, &["nf-0"]);

    let plugin = NfDevicePlugin::new(
        dir.path(),
        "nf-net.sock",
        "netfn.io/nf",
        dir.path().join("no-kubelet.sock"),
        Arc::new(DeviceRegistry::new()),
        VendorClient::new(vendor_socket, Duration::from_secs(2)),
        Duration::from_millis(30),
        fast_backoff(),
    );

    let err = plugin.start(CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(
            err,
            nf_device_broker::PluginError::Connection { .. }
                | nf_device_broker::PluginError::Registration { .. }
        ),
        "{err}"
    );
}

#[tokio::test]
async fn test_graceful_shutdown_releases_socket() {
    let (session, server) = start_session(&["nf-0"]).await;
    let socket_path = session.plugin.socket_path().to_path_buf();
    assert!(socket_path.exists());

    session.token.cancel();
    let _ = server.await;
    session.plugin.shutdown().unwrap();

    assert!(!socket_path.exists());
    assert!(session.plugin.registry().is_empty());
}
