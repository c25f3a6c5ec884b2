pub mod attempt;
pub mod config;
pub mod runner;

pub use config::PipelineConfig;
pub use runner::{PipelineRunner, StageSlot};
