use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

const GB: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_ROOT_PATH: &str = "/sys/fs/cgroup";
pub const DEFAULT_SERVER_GROUP: &str = "jogger";
pub const DEFAULT_MEMORY_TARGET_BYTES: u64 = 4 * GB;

// Controllers enabled for job cgroups, in subtree_control syntax.
const CONTROLLERS: &str = "+cpu +memory +io";

// How often a drain watcher re-reads cgroup.events.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

// rmdir retry schedule for a drained leaf.
const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct FsManagerConfig {
    pub root_path: PathBuf,
    pub server_group: String,
    pub memory_target_bytes: u64,
}

impl Default for FsManagerConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from(DEFAULT_ROOT_PATH),
            server_group: DEFAULT_SERVER_GROUP.to_string(),
            memory_target_bytes: DEFAULT_MEMORY_TARGET_BYTES,
        }
    }
}

/// Owns the cgroup-v2 subtree the server operates within.
///
/// Per-job leaves are created under `<root>/<server_group>/` and handed to
/// the spawn path as an open directory fd. Leaves cannot be unlinked while
/// populated, so removal is asynchronous: a watcher polls the leaf's
/// `cgroup.events` until the kernel reports no remaining tasks.
pub struct FsManager {
    root_path: PathBuf,
    server_group: String,
    memory_target_bytes: u64,

    // cgroup name -> open leaf handle
    groups: Mutex<HashMap<String, CGroup>>,

    shutdown: CancellationToken,
}

struct CGroup {
    dir: File,
    path: PathBuf,
    events_path: PathBuf,
}

impl CGroup {
    fn fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }
}

impl FsManager {
    /// Enable the controllers on the root subtree, create the server's
    /// intermediate group, and enable the controllers there too:
    ///
    /// `echo "+cpu +memory +io" > /sys/fs/cgroup/cgroup.subtree_control`
    /// `mkdir /sys/fs/cgroup/jogger`
    /// `echo "+cpu +memory +io" > /sys/fs/cgroup/jogger/cgroup.subtree_control`
    pub async fn new(config: FsManagerConfig, shutdown: CancellationToken) -> Result<Self> {
        let manager = Self {
            root_path: config.root_path,
            server_group: config.server_group,
            memory_target_bytes: config.memory_target_bytes,
            groups: Mutex::new(HashMap::new()),
            shutdown,
        };
        manager.init().await.map_err(Error::CGroupInit)?;
        Ok(manager)
    }

    async fn init(&self) -> io::Result<()> {
        tokio::fs::write(self.root_path.join("cgroup.subtree_control"), CONTROLLERS).await?;

        let server_dir = self.root_path.join(&self.server_group);
        match tokio::fs::create_dir(&server_dir).await {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            other => other?,
        }
        tokio::fs::write(server_dir.join("cgroup.subtree_control"), CONTROLLERS).await?;
        Ok(())
    }

    /// Create a leaf group and return the fd of its open directory. The
    /// handle stays open until `remove_group` has seen the leaf drain.
    pub async fn add_group(&self, name: &str) -> Result<RawFd> {
        let add_err = |source| Error::CGroupAdd {
            name: name.to_string(),
            source,
        };

        let dir_path = self.root_path.join(&self.server_group).join(name);
        tokio::fs::create_dir(&dir_path).await.map_err(add_err)?;

        let dir = match File::open(&dir_path) {
            Ok(dir) => dir,
            Err(err) => {
                let _ = tokio::fs::remove_dir(&dir_path).await;
                return Err(add_err(err));
            }
        };

        // each leaf gets a hard memory ceiling of a fifth of the
        // server-wide target
        let memory_max = (self.memory_target_bytes / 5).to_string();
        if let Err(err) = tokio::fs::write(dir_path.join("memory.max"), memory_max).await {
            let _ = tokio::fs::remove_dir(&dir_path).await;
            return Err(add_err(err));
        }

        let fd = dir.as_raw_fd();
        let group = CGroup {
            dir,
            events_path: dir_path.join("cgroup.events"),
            path: dir_path,
        };
        self.groups
            .lock()
            .expect("cgroup map lock poisoned")
            .insert(name.to_string(), group);
        debug!(cgroup = name, fd, "created cgroup leaf");
        Ok(fd)
    }

    /// Schedule removal of a leaf group. A no-op when the group is unknown
    /// or already being removed.
    ///
    /// The watcher polls `cgroup.events` until the kernel reports
    /// `populated 0`, then closes the directory handle and unlinks the
    /// leaf. The caller is never blocked; the returned handle is only
    /// interesting to tests.
    pub fn remove_group(&self, name: &str) -> JoinHandle<()> {
        let group = self
            .groups
            .lock()
            .expect("cgroup map lock poisoned")
            .remove(name);
        let name = name.to_string();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let Some(group) = group else {
                return;
            };
            group.drain_and_remove(&name, shutdown).await;
        })
    }
}

impl CGroup {
    async fn drain_and_remove(self, name: &str, shutdown: CancellationToken) {
        let mut ticker = interval(DRAIN_POLL_INTERVAL);
        loop {
            match tokio::fs::read_to_string(&self.events_path).await {
                Ok(events) if is_unpopulated(&events) => break,
                Ok(_) => {}
                // a missing events file means the leaf is already gone
                Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                Err(err) => {
                    warn!(cgroup = name, error = %err, "failed to read cgroup.events, will retry");
                }
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    warn!(cgroup = name, "shutdown while waiting for cgroup to drain");
                    break;
                }
            }
        }

        let path = self.path.clone();
        drop(self); // close the directory handle before unlinking

        for attempt in 1..=REMOVE_ATTEMPTS {
            match tokio::fs::remove_dir(&path).await {
                Ok(()) => {
                    debug!(cgroup = name, "removed cgroup leaf");
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => return,
                Err(err) => {
                    let removal = Error::CGroupRemove {
                        name: name.to_string(),
                        source: err,
                    };
                    if attempt == REMOVE_ATTEMPTS {
                        error!(error = %removal, "giving up on cgroup removal");
                    } else {
                        warn!(error = %removal, attempt, "retrying cgroup removal");
                        tokio::time::sleep(REMOVE_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

fn is_unpopulated(events: &str) -> bool {
    events.lines().any(|line| line.trim() == "populated 0")
}
