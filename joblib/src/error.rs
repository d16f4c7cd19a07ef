use std::io;
use std::result;

use thiserror::Error;

use crate::types::JobId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("failed to spawn job process: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("failed to initialize cgroup manager: {0}")]
    CGroupInit(#[source] io::Error),

    #[error("failed to create cgroup {name}: {source}")]
    CGroupAdd { name: String, source: io::Error },

    #[error("failed to remove cgroup {name}: {source}")]
    CGroupRemove { name: String, source: io::Error },

    #[error("output streamer is closed")]
    WriterClosed,
}

pub type Result<T> = result::Result<T, Error>;
