pub mod job_store;

pub use job_store::{JobPage, JobQuery, JobStore, StatusCounts};
