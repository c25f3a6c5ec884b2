pub mod job;
pub mod pool;

pub use job::JobOutcome;
pub use pool::WorkerPool;
