mod demo_app;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wsgiprox_core::{Dispatcher, FixedResolver};
use wsgiprox_shared::WsgiproxCa;

use demo_app::EchoApp;

/// Intercepting HTTP/HTTPS proxy: terminates TLS with a locally-issued CA,
/// rewrites the effective URL, and hands requests to an embedded app.
#[derive(Parser, Debug)]
#[command(name = "wsgiprox", version, about)]
struct Args {
    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory holding the root CA and the cached leaf certificates.
    /// Defaults to a `wsgiprox` directory under the user's data dir.
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Prefix the resolver prepends to non-identity URLs.
    #[arg(long, default_value = "http://localhost:8080/replay/")]
    resolver_prefix: String,

    /// Hostnames for which the resolver returns the bare path, unrewritten.
    #[arg(long = "identity-host")]
    identity_hosts: Vec<String>,

    /// Hostnames the proxy answers magic CA-distribution paths on.
    #[arg(long = "own-hostname", default_value = "wsgiprox")]
    own_hostnames: Vec<String>,

    /// Issue wildcard-parent certificates instead of exact-host ones.
    #[arg(long)]
    wildcard_cert: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let ca_dir = args
        .ca_dir
        .or_else(|| dirs::data_dir().map(|d| d.join("wsgiprox")))
        .ok_or_else(|| anyhow::anyhow!("could not determine a CA persistence directory"))?;

    let ca = WsgiproxCa::init(&ca_dir.join("wsgiprox-ca.pem"), &ca_dir.join("certs"), "wsgiprox")?;
    let resolver = Arc::new(FixedResolver::new(args.resolver_prefix, args.identity_hosts));
    let app = Arc::new(EchoApp);
    let dispatcher = Dispatcher::new(resolver, app, ca, args.own_hostnames, args.wildcard_cert);

    let listener = TcpListener::bind(args.listen).await?;
    info!("wsgiprox listening on {}", args.listen);

    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.serve_connection(stream).await {
                error!("connection from {peer} ended: {e}");
            }
        });
    }
}
