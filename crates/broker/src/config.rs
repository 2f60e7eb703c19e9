use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

#[derive(Parser)]
#[command(about = "Node-resident device broker", long_about = None, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device broker daemon
    Daemon(DaemonArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet/device-plugins",
        help = "Directory holding the kubelet and device-plugin sockets"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_ENDPOINT",
        default_value = "nf-net.sock",
        help = "Socket file name announced to the kubelet, created under --plugin-dir"
    )]
    pub endpoint_file: String,

    #[arg(
        long,
        env = "KUBELET_SOCKET_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/lib/kubelet/device-plugins/kubelet.sock",
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket_path: PathBuf,

    #[arg(
        long,
        env = "RESOURCE_NAME",
        default_value = "netfn.io/nf",
        help = "Resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        env = "VENDOR_PLUGIN_SOCKET_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/run/vendor-plugin/vendor-plugin.sock",
        help = "Vendor device service socket"
    )]
    pub vendor_socket_path: PathBuf,

    #[arg(
        long,
        env = "HEALTH_POLL_INTERVAL_SECS",
        default_value = "5",
        help = "Seconds between registry health checks on an open watch stream"
    )]
    pub health_poll_interval_secs: u64,

    #[arg(
        long,
        env = "DISCOVERY_TIMEOUT_SECS",
        default_value = "10",
        help = "Upper bound on the vendor device enumeration call"
    )]
    pub discovery_timeout_secs: u64,
}
