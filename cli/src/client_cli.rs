use std::io::Write;
use std::path::Path;

use protobuf::job_service_client::JobServiceClient;
use protobuf::{Job, OutputRequest, StartRequest, StatusRequest, StopRequest};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::Request;
use uuid::Uuid;

pub struct ClientCli {
    inner: JobServiceClient<Channel>,
}

impl ClientCli {
    pub async fn connect(
        server: &str,
        ca_cert_file: &Path,
        user_cert_file: &Path,
        user_key_file: &Path,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let ca_cert = tokio::fs::read(ca_cert_file).await?;
        let user_cert = tokio::fs::read(user_cert_file).await?;
        let user_key = tokio::fs::read(user_key_file).await?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca_cert))
            .identity(Identity::from_pem(user_cert, user_key));

        let channel = Channel::from_shared(format!("https://{server}"))?
            .tls_config(tls)?
            .connect()
            .await?;

        Ok(Self {
            inner: JobServiceClient::new(channel),
        })
    }

    pub async fn start_job(&mut self, cmd: &str, args: &[String]) -> Result<(), tonic::Status> {
        let request = Request::new(StartRequest {
            job: Some(Job {
                cmd: cmd.to_string(),
                args: args.to_vec(),
            }),
        });
        let response = self.inner.start(request).await?;
        println!("job started: {}", response.into_inner().job_id);
        Ok(())
    }

    pub async fn stop_job(&mut self, job_id: Uuid) -> Result<(), tonic::Status> {
        let request = Request::new(StopRequest {
            job_id: job_id.to_string(),
        });
        self.inner.stop(request).await?;
        println!("job stopped: {job_id}");
        Ok(())
    }

    pub async fn query_status(&mut self, job_id: Uuid) -> Result<(), tonic::Status> {
        let request = Request::new(StatusRequest {
            job_id: job_id.to_string(),
        });
        let response = self.inner.status(request).await?;
        println!("job status: {}", status_word(response.into_inner().status()));
        Ok(())
    }

    /// Stream the job's output to stdout until end-of-stream or Ctrl-C.
    pub async fn stream_output(&mut self, job_id: Uuid) -> Result<(), tonic::Status> {
        let request = Request::new(OutputRequest {
            job_id: job_id.to_string(),
        });
        let mut stream = self.inner.output(request).await?.into_inner();
        let mut stdout = std::io::stdout();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                message = stream.message() => {
                    let Some(response) = message? else { break };
                    let Some(data) = response.data else { continue };
                    if let Err(err) = stdout.write_all(&data.data).and_then(|_| stdout.flush()) {
                        if err.kind() == std::io::ErrorKind::BrokenPipe {
                            break;
                        }
                        let _ = writeln!(std::io::stderr(), "{err}");
                    }
                }
            }
        }
        Ok(())
    }
}

fn status_word(status: protobuf::Status) -> &'static str {
    match status {
        protobuf::Status::Unspecified => "unknown",
        protobuf::Status::Running => "running",
        protobuf::Status::Completed => "completed",
        protobuf::Status::Stopped => "stopped",
        protobuf::Status::Killed => "killed",
        protobuf::Status::Failed => "failed",
    }
}
