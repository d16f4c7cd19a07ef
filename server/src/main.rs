mod interceptors;
mod services;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use interceptors::cert;
pub use interceptors::cert::UserExtension;
use joblib::cgroup::{self, FsManager, FsManagerConfig};
use joblib::Manager;
use protobuf::job_service_server::JobServiceServer;
use services::jobservice::JoggerService;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Five seconds more than the job grace period, so every job can be
// signalled, reaped, and its cgroup drained before the listener is torn
// down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "jogger-server", about = "Remote job execution over mTLS grpc")]
struct Args {
    /// CA certificate used to verify client certificates
    #[arg(long, env = "JOGGER_CA_CERT_FILE", default_value = "certs/ca_tls.crt")]
    ca_cert_file: PathBuf,

    /// Server TLS certificate
    #[arg(long, env = "JOGGER_SERVER_CERT_FILE", default_value = "certs/server1_tls.crt")]
    server_cert_file: PathBuf,

    /// Server TLS private key
    #[arg(long, env = "JOGGER_SERVER_KEY_FILE", default_value = "certs/server1_tls.key")]
    server_key_file: PathBuf,

    /// Port to listen on
    #[arg(long, env = "JOGGER_SERVER_PORT", default_value_t = 50051)]
    port: u16,

    /// Mount point of the cgroup-v2 hierarchy
    #[arg(long, env = "JOGGER_CGROUP_ROOT", default_value = cgroup::DEFAULT_ROOT_PATH)]
    cgroup_root: PathBuf,

    /// Name of the intermediate cgroup all job leaves live under
    #[arg(long, env = "JOGGER_CGROUP_NAME", default_value = cgroup::DEFAULT_SERVER_GROUP)]
    cgroup_name: String,

    /// Server-wide memory target; each job leaf is capped at a fifth of it
    #[arg(long, env = "JOGGER_MEMORY_TARGET_BYTES", default_value_t = cgroup::DEFAULT_MEMORY_TARGET_BYTES)]
    memory_target_bytes: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(?args, "starting service");
    run(args).await?;
    info!("stopping service");
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    // mTLS: present our identity, require and verify client certs
    let server_cert = tokio::fs::read(&args.server_cert_file).await?;
    let server_key = tokio::fs::read(&args.server_key_file).await?;
    let ca_cert = tokio::fs::read(&args.ca_cert_file).await?;
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(server_cert, server_key))
        .client_ca_root(Certificate::from_pem(ca_cert));

    // Cancelling this token sends every running job a SIGTERM; after the
    // grace period the jobs are force killed.
    let shutdown = install_shutdown_handler();

    let cgroups = FsManager::new(
        FsManagerConfig {
            root_path: args.cgroup_root,
            server_group: args.cgroup_name,
            memory_target_bytes: args.memory_target_bytes,
        },
        shutdown.clone(),
    )
    .await?;
    let manager = Arc::new(Manager::new(Arc::new(cgroups), shutdown.clone()));

    let job_service = JoggerService::new(manager);
    let job_server = JobServiceServer::with_interceptor(job_service, cert::extract_common_name);

    let addr = format!("[::]:{}", args.port).parse()?;
    info!(%addr, "listening");

    let serve = Server::builder()
        .tls_config(tls)?
        .add_service(job_server)
        .serve_with_shutdown(addr, {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        } => {
            warn!("graceful shutdown timed out, forcing exit");
        }
    }
    Ok(())
}

/// Cancel the returned token when SIGTERM or SIGINT arrives, so every
/// subsystem can drain gracefully.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
        }

        handler_token.cancel();
    });

    token
}
