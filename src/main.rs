use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use arl::config::Config;
use arl::gateway::kube::KubeSandboxProvisioner;
use arl::gateway::{self, AppState};

#[derive(Parser)]
#[command(name = "arl")]
#[command(about = "Sandbox lifecycle and session control plane for agentic workloads")]
#[command(version)]
struct Cli {
    /// Path to the arl.toml configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Gateway's HTTP/WebSocket server
    Serve,
    /// Run a reconcile controller
    Controller {
        #[command(subcommand)]
        which: ControllerTarget,
    },
    /// Manage WarmPools via the Gateway's REST API
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Print the CRD manifests this crate's types describe
    Crds,
}

#[derive(Subcommand)]
enum ControllerTarget {
    /// Reconcile WarmPool replica counts against pod state
    Warmpool,
    /// Adopt idle pods onto Sandboxes and reap expired ones
    Sandbox,
}

#[derive(Subcommand)]
enum PoolAction {
    Create {
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value_t = 1)]
        replicas: u32,
    },
    Get {
        name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
    },
    Patch {
        name: String,
        #[arg(long)]
        replicas: Option<u32>,
        #[arg(long, default_value = "default")]
        namespace: String,
    },
    Delete {
        name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
    },
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(p).with_context(|| format!("reading config from {}", p.display())),
        None => {
            let default_path = PathBuf::from("arl.toml");
            if default_path.exists() {
                Config::from_file(&default_path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            let client = kube::Client::try_default()
                .await
                .context("connecting to Kubernetes (is KUBECONFIG set?)")?;
            let provisioner = Arc::new(KubeSandboxProvisioner::new(
                client.clone(),
                config.sidecar.port,
                std::time::Duration::from_secs(config.sidecar.rpc_timeout_seconds),
            ));
            let addr = config.gateway.listen_addr.parse()?;
            let state = Arc::new(AppState::new(provisioner, Some(client), config));

            let sweep_state = state.clone();
            tokio::spawn(async move {
                gateway::run_idle_sweep(sweep_state, std::time::Duration::from_secs(30)).await;
            });

            gateway::run_server(addr, state).await?;
        }
        Commands::Controller { which } => {
            let client = kube::Client::try_default()
                .await
                .context("connecting to Kubernetes (is KUBECONFIG set?)")?;
            let controller_config = Arc::new(config.controller);
            match which {
                ControllerTarget::Warmpool => {
                    arl::controller::warmpool::run(client, controller_config).await?;
                }
                ControllerTarget::Sandbox => {
                    arl::controller::sandbox::run(client, controller_config).await?;
                }
            }
        }
        Commands::Pool { action } => {
            run_pool_action(action, &config).await?;
        }
        Commands::Crds => {
            for (kind, yaml) in arl::crd::generate_crd_manifests()? {
                println!("# {kind}\n{yaml}");
            }
        }
    }

    Ok(())
}

/// Thin REST client over the Gateway's own `/v1/pools` surface, built on
/// the same hyper client stack the Gateway's server uses for its side of
/// the connection, since `arl-sdk` (sdk/rust) is the right place for a
/// full client but a CLI one-shot doesn't need to pull in a second HTTP
/// client crate for it.
async fn run_pool_action(action: PoolAction, config: &Config) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .gateway
        .listen_addr
        .parse()
        .context("parsing gateway.listen_addr")?;

    match action {
        PoolAction::Create {
            name,
            image,
            namespace,
            replicas,
        } => {
            let body = serde_json::json!({
                "name": name,
                "namespace": namespace,
                "image": image,
                "replicas": replicas,
            });
            send_request(addr, "POST", "/v1/pools", Some(body)).await?;
        }
        PoolAction::Get { name, namespace } => {
            send_request(addr, "GET", &format!("/v1/pools/{name}?namespace={namespace}"), None).await?;
        }
        PoolAction::Patch {
            name,
            replicas,
            namespace,
        } => {
            let body = serde_json::json!({ "replicas": replicas, "namespace": namespace });
            send_request(addr, "PATCH", &format!("/v1/pools/{name}"), Some(body)).await?;
        }
        PoolAction::Delete { name, namespace } => {
            send_request(addr, "DELETE", &format!("/v1/pools/{name}?namespace={namespace}"), None).await?;
        }
    }
    Ok(())
}

/// Issue one request against the Gateway over a fresh HTTP/1.1
/// connection and print the response body, matching the one-shot nature
/// of a CLI invocation (no connection reuse across commands).
async fn send_request(
    addr: std::net::SocketAddr,
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> Result<()> {
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper_util::rt::TokioIo;

    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to gateway at {addr}"))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let mut req = hyper::Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"))
        .header("host", addr.to_string());
    if !payload.is_empty() {
        req = req.header("content-type", "application/json");
    }
    let req = req.body(Full::new(bytes::Bytes::from(payload)))?;

    let resp: hyper::Response<Incoming> = sender.send_request(req).await?;
    let status = resp.status();
    let body_bytes = resp.into_body().collect().await?.to_bytes();
    let text = String::from_utf8_lossy(&body_bytes).to_string();
    if !status.is_success() {
        bail!("{status}: {text}");
    }
    if !text.is_empty() {
        println!("{text}");
    }
    Ok(())
}
