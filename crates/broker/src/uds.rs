//! Unix-domain-socket channel plumbing shared by the vendor client, the
//! self-test dial and kubelet registration.

use std::path::Path;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

/// Connects a gRPC channel over the unix socket at `socket_path`.
///
/// The HTTP URI is a placeholder; the connector ignores it and dials the
/// socket directly.
pub async fn channel(socket_path: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket_path = socket_path.to_path_buf();

    Endpoint::from_static("http://broker")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await
}
