mod client_cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client_cli::ClientCli;
use uuid::Uuid;

/// Run and manage jobs on a jogger server
#[derive(Debug, Parser)]
#[command(name = "jog")]
struct Cli {
    /// The address of the server, host:port
    #[arg(short = 's', long = "server", env = "JOGGER_HOST")]
    server: String,

    /// CA certificate used to verify the server
    #[arg(long, env = "JOGGER_CA_CERT_FILE")]
    ca_cert_file: PathBuf,

    /// Certificate presented to the server; its common name is your username
    #[arg(long, env = "JOGGER_USER_CERT_FILE")]
    user_cert_file: PathBuf,

    /// Private key for the user certificate
    #[arg(long, env = "JOGGER_USER_KEY_FILE")]
    user_key_file: PathBuf,

    /// The sub-command to issue
    #[command(subcommand)]
    sub_command: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Start a job on the server
    Start {
        command: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Request termination of a job
    Stop { job_id: Uuid },
    /// Query the status of a job
    Status { job_id: Uuid },
    /// Stream a job's combined stdout/stderr from the beginning
    Output { job_id: Uuid },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = ClientCli::connect(
        &cli.server,
        &cli.ca_cert_file,
        &cli.user_cert_file,
        &cli.user_key_file,
    )
    .await?;

    match cli.sub_command {
        SubCommand::Start { command, args } => client.start_job(&command, &args).await?,
        SubCommand::Stop { job_id } => client.stop_job(job_id).await?,
        SubCommand::Status { job_id } => client.query_status(job_id).await?,
        SubCommand::Output { job_id } => client.stream_output(job_id).await?,
    }
    Ok(())
}
