use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::cgroup::FsManager;
use crate::error::{Error, Result};
use crate::job::{Job, Status};
use crate::types::{JobId, OutputBlob};

/// The service façade: a registry of jobs keyed by `(username, job id)`,
/// tied to one server-wide shutdown token.
///
/// The composite key is the whole authorization model. A caller can only
/// address jobs under their own username; someone else's job id and a
/// nonexistent one are the same [`Error::NotFound`], so ids leak nothing.
/// Jobs are never removed: a finished job stays queryable until the server
/// exits.
pub struct Manager {
    jobs: RwLock<HashMap<(String, JobId), Arc<Job>>>,
    cgroups: Arc<FsManager>,
    shutdown: CancellationToken,
}

impl Manager {
    pub fn new(cgroups: Arc<FsManager>, shutdown: CancellationToken) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            cgroups,
            shutdown,
        }
    }

    /// Provision a cgroup leaf, spawn the job into it, and register it
    /// under the caller's name. The leaf is reclaimed on spawn failure and,
    /// otherwise, once the job is done and its process tree has drained.
    pub async fn start(&self, username: &str, cmd: &str, args: &[String]) -> Result<JobId> {
        let job_id = Uuid::new_v4();
        let group = job_id.to_string();
        let cgroup_fd = self.cgroups.add_group(&group).await?;

        let job = match Job::start(&self.shutdown, cgroup_fd, cmd, args) {
            Ok(job) => Arc::new(job),
            Err(err) => {
                // nothing ever ran in the leaf, so it drains immediately
                self.cgroups.remove_group(&group);
                return Err(err);
            }
        };

        // cgroup directories cannot be unlinked while populated; hold off
        // on removal until the job has been reaped
        let cgroups = Arc::clone(&self.cgroups);
        let done_job = Arc::clone(&job);
        tokio::spawn(async move {
            done_job.wait().await;
            cgroups.remove_group(&group);
        });

        self.jobs
            .write()
            .expect("job map lock poisoned")
            .insert((username.to_string(), job_id), job);
        info!(%job_id, username, cmd, "job started");
        Ok(job_id)
    }

    /// Request termination of a job. Stopping an already-terminal job is a
    /// no-op, not an error.
    pub fn stop(&self, username: &str, job_id: JobId) -> Result<()> {
        self.get(username, job_id)?.stop();
        info!(%job_id, username, "job stop requested");
        Ok(())
    }

    pub fn status(&self, username: &str, job_id: JobId) -> Result<Status> {
        Ok(self.get(username, job_id)?.status())
    }

    /// Stream a job's combined output from offset 0. `cancel` ends this
    /// reader only; the job and any other readers are untouched.
    pub fn output_stream(
        &self,
        username: &str,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<OutputBlob>> {
        Ok(self.get(username, job_id)?.output_stream(cancel))
    }

    fn get(&self, username: &str, job_id: JobId) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .expect("job map lock poisoned")
            .get(&(username.to_string(), job_id))
            .cloned()
            .ok_or(Error::NotFound(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::FsManagerConfig;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn scratch_manager() -> (TempDir, Manager, CancellationToken) {
        let root = tempfile::tempdir().expect("tempdir");
        let shutdown = CancellationToken::new();
        let config = FsManagerConfig {
            root_path: root.path().to_path_buf(),
            server_group: "jogger-test".to_string(),
            memory_target_bytes: 5 * 1024 * 1024 * 1024,
        };
        let cgroups = FsManager::new(config, shutdown.clone())
            .await
            .expect("cgroup init failed");
        let manager = Manager::new(Arc::new(cgroups), shutdown.clone());
        (root, manager, shutdown)
    }

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    async fn collect(mut rx: mpsc::Receiver<OutputBlob>) -> Vec<u8> {
        let mut bytes = vec![];
        while let Some(chunk) = rx.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    async fn wait_for_terminal(manager: &Manager, username: &str, job_id: JobId) -> Status {
        timeout(Duration::from_secs(30), async {
            loop {
                let status = manager.status(username, job_id).expect("job disappeared");
                if status != Status::Running {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("job never reached a terminal status")
    }

    #[tokio::test]
    async fn start_stream_and_complete() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let job_id = manager
            .start("alice", "echo", &args(&["hello"]))
            .await
            .expect("start err");

        let rx = manager
            .output_stream("alice", job_id, CancellationToken::new())
            .expect("stream err");
        let output = timeout(Duration::from_secs(30), collect(rx))
            .await
            .expect("stream never ended");
        assert_eq!(output, b"hello\n");
        // end-of-stream means the writer closed, which the reaper only does
        // after recording the terminal status
        assert_eq!(
            manager.status("alice", job_id).expect("status err"),
            Status::Completed
        );
    }

    #[tokio::test]
    async fn late_subscriber_gets_the_whole_output() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let job_id = manager
            .start("alice", "sh", &args(&["-c", "printf A; sleep 1; printf B"]))
            .await
            .expect("start err");

        assert_eq!(wait_for_terminal(&manager, "alice", job_id).await, Status::Completed);

        let rx = manager
            .output_stream("alice", job_id, CancellationToken::new())
            .expect("stream err");
        let output = timeout(Duration::from_secs(30), collect(rx))
            .await
            .expect("stream never ended");
        assert_eq!(output, b"AB");
    }

    #[tokio::test]
    async fn other_users_cannot_see_the_job() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let job_id = manager
            .start("alice", "sleep", &args(&["30"]))
            .await
            .expect("start err");

        assert!(matches!(manager.status("bob", job_id), Err(Error::NotFound(_))));
        assert!(matches!(manager.stop("bob", job_id), Err(Error::NotFound(_))));
        assert!(matches!(
            manager.output_stream("bob", job_id, CancellationToken::new()),
            Err(Error::NotFound(_))
        ));

        // the owner still can
        manager.stop("alice", job_id).expect("owner stop err");
        assert_eq!(wait_for_terminal(&manager, "alice", job_id).await, Status::Stopped);
    }

    #[tokio::test]
    async fn unknown_job_id_is_not_found() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let bogus = Uuid::new_v4();
        assert!(matches!(manager.status("alice", bogus), Err(Error::NotFound(id)) if id == bogus));
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let result = manager.start("alice", "no-such-binary-anywhere", &[]).await;
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
        assert!(manager.jobs.read().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn stop_on_a_finished_job_is_a_noop() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let job_id = manager
            .start("alice", "echo", &args(&["done"]))
            .await
            .expect("start err");
        assert_eq!(wait_for_terminal(&manager, "alice", job_id).await, Status::Completed);

        manager.stop("alice", job_id).expect("stop err");
        assert_eq!(
            manager.status("alice", job_id).expect("status err"),
            Status::Completed
        );
    }

    #[tokio::test]
    async fn fan_out_readers_see_identical_output() {
        let (_root, manager, _shutdown) = scratch_manager().await;
        let job_id = manager
            .start("alice", "seq", &args(&["1", "2000"]))
            .await
            .expect("start err");

        let early = manager
            .output_stream("alice", job_id, CancellationToken::new())
            .expect("stream err");
        assert_eq!(wait_for_terminal(&manager, "alice", job_id).await, Status::Completed);
        let late = manager
            .output_stream("alice", job_id, CancellationToken::new())
            .expect("stream err");

        let expected: Vec<u8> = (1..=2000).flat_map(|n| format!("{n}\n").into_bytes()).collect();
        for rx in [early, late] {
            let output = timeout(Duration::from_secs(30), collect(rx))
                .await
                .expect("stream never ended");
            assert_eq!(output, expected);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_every_job() {
        let (_root, manager, shutdown) = scratch_manager().await;
        let first = manager
            .start("alice", "sleep", &args(&["30"]))
            .await
            .expect("start err");
        let second = manager
            .start("bob", "sleep", &args(&["30"]))
            .await
            .expect("start err");

        shutdown.cancel();
        assert_eq!(wait_for_terminal(&manager, "alice", first).await, Status::Stopped);
        assert_eq!(wait_for_terminal(&manager, "bob", second).await, Status::Stopped);
    }
}
