use uuid::Uuid;

pub type JobId = Uuid;
pub type OutputBlob = bytes::Bytes;
