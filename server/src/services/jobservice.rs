use std::io;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use joblib::types::JobId;
use joblib::Manager;
use protobuf::job_service_server::JobService;
use protobuf::{
    OutputData, OutputRequest, OutputResponse, StartRequest, StartResponse, StatusRequest,
    StatusResponse, StopRequest, StopResponse,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::UserExtension;

/// The grpc front end over the job manager. Every handler resolves the
/// authenticated username planted by the certificate interceptor and
/// threads it into the core; the core's registry does the rest.
pub struct JoggerService {
    manager: Arc<Manager>,
}

impl JoggerService {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl JobService for JoggerService {
    type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputResponse, Status>> + Send>>;

    async fn start(
        &self,
        req: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let username = username(&req)?;
        let job = req
            .into_inner()
            .job
            .ok_or_else(|| Status::invalid_argument("missing job"))?;
        info!(username, cmd = %job.cmd, args = ?job.args, "starting job");

        let job_id = self
            .manager
            .start(&username, &job.cmd, &job.args)
            .await
            .map_err(into_status)?;
        info!(username, %job_id, "job started");
        Ok(Response::new(StartResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn stop(&self, req: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let username = username(&req)?;
        let job_id = parse_job_id(&req.get_ref().job_id)?;
        info!(username, %job_id, "stopping job");

        self.manager.stop(&username, job_id).map_err(into_status)?;
        Ok(Response::new(StopResponse {}))
    }

    async fn status(
        &self,
        req: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let username = username(&req)?;
        let job_id = parse_job_id(&req.get_ref().job_id)?;

        let status = self.manager.status(&username, job_id).map_err(into_status)?;
        info!(username, %job_id, ?status, "job status");
        Ok(Response::new(StatusResponse {
            status: proto_status(status) as i32,
        }))
    }

    async fn output(
        &self,
        req: Request<OutputRequest>,
    ) -> Result<Response<Self::OutputStream>, Status> {
        let username = username(&req)?;
        let job_id = parse_job_id(&req.get_ref().job_id)?;
        info!(username, %job_id, "streaming job output");

        let cancel = CancellationToken::new();
        let receiver = self
            .manager
            .output_stream(&username, job_id, cancel.clone())
            .map_err(into_status)?;

        // dropping the response stream (client went away) cancels this
        // reader and only this reader
        let guard = cancel.drop_guard();
        let stream = ReceiverStream::new(receiver).map(move |blob| {
            let _ = &guard;
            Ok(OutputResponse {
                data: Some(OutputData {
                    data: blob.to_vec(),
                }),
            })
        });
        Ok(Response::new(Box::pin(stream) as Self::OutputStream))
    }
}

fn username<T>(req: &Request<T>) -> Result<String, Status> {
    req.extensions()
        .get::<UserExtension>()
        .map(|user| user.username.clone())
        .ok_or_else(|| Status::unauthenticated("no authenticated user"))
}

fn parse_job_id(raw: &str) -> Result<JobId, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid job id: {raw}")))
}

fn proto_status(status: joblib::Status) -> protobuf::Status {
    match status {
        joblib::Status::Running => protobuf::Status::Running,
        joblib::Status::Completed => protobuf::Status::Completed,
        joblib::Status::Stopped => protobuf::Status::Stopped,
        joblib::Status::Killed => protobuf::Status::Killed,
        joblib::Status::Failed => protobuf::Status::Failed,
    }
}

fn into_status(err: joblib::error::Error) -> Status {
    use joblib::error::Error;
    match &err {
        Error::NotFound(_) => Status::not_found(err.to_string()),
        // distinguish a bad command line from a broken server
        Error::SpawnFailed(source) => match source.kind() {
            io::ErrorKind::NotFound => Status::not_found(err.to_string()),
            io::ErrorKind::PermissionDenied => Status::permission_denied(err.to_string()),
            _ => Status::internal(err.to_string()),
        },
        _ => Status::internal(err.to_string()),
    }
}
