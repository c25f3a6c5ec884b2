pub mod artifacts;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod sanitize;
pub mod stage;
pub mod status;
pub mod store;
pub mod worker;

pub use artifacts::ArtifactRegistry;
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, Config, RecoveryPolicy};
pub use db::Database;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{CaseflowError, ConfigError, JobError, Result, StageError, WorkerError};
pub use job::{BatchRequest, Job, JobOptions, JobStatus, JobStatusView, Lease, LogLevel};
pub use pipeline::{PipelineConfig, PipelineRunner};
pub use queue::JobQueue;
pub use stage::{CommandStage, Stage, StageContext, StageKind, StageOutput};
pub use status::StatusReader;
pub use store::{JobQuery, JobStore};
