pub mod cgroup;
pub mod error;
pub mod job;
pub mod manager;
pub mod output;
pub mod types;

pub use job::Status;
pub use manager::Manager;
