pub mod model;
pub mod options;
pub mod request;

pub use model::{
    Artifact, Job, JobStatus, JobStatusView, JobSummary, Lease, LogEntry, LogLevel,
};
pub use options::JobOptions;
pub use request::BatchRequest;
