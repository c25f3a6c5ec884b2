//! Analysis stages as opaque units of work.
//!
//! A stage only knows how to turn a job's inputs into named artifacts. It
//! never touches the job store: progress and artifacts flow back to the
//! pipeline runner, which owns every write.

pub mod command;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::job::JobOptions;

pub use command::CommandStage;

/// The analysis stages, in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Transcribe,
    Diarize,
    ExtractEntities,
    DetectDiscrepancies,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Transcribe,
        StageKind::Diarize,
        StageKind::ExtractEntities,
        StageKind::DetectDiscrepancies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Transcribe => "transcribe",
            StageKind::Diarize => "diarize",
            StageKind::ExtractEntities => "extract_entities",
            StageKind::DetectDiscrepancies => "detect_discrepancies",
        }
    }

    /// Whether the job's options turn this stage off.
    pub fn is_disabled_by(&self, options: &JobOptions) -> bool {
        match self {
            StageKind::Transcribe => !options.auto_transcribe,
            StageKind::Diarize => !options.diarize,
            StageKind::ExtractEntities | StageKind::DetectDiscrepancies => false,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An artifact reported by a stage, before it is recorded on the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub name: String,
    /// Absolute, or relative to the stage's output directory.
    pub location: String,
}

impl ProducedArtifact {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub artifacts: Vec<ProducedArtifact>,
}

/// Messages from a running attempt back to the runner.
#[derive(Debug)]
pub enum StageEvent {
    /// Fraction of the stage's own work done, in [0, 1].
    Progress(f64),
    Finished(Result<StageOutput, StageError>),
}

/// Everything a stage attempt may read, plus its channel back to the runner.
pub struct StageContext {
    pub job_id: String,
    pub kind: StageKind,
    pub upload_ids: Vec<String>,
    pub video_paths: Vec<PathBuf>,
    pub options: JobOptions,
    /// Directory exclusive to this job and stage; emptied before each attempt.
    pub output_dir: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
    events: Sender<StageEvent>,
    abandoned: Arc<AtomicBool>,
}

impl StageContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<String>,
        kind: StageKind,
        upload_ids: Vec<String>,
        video_paths: Vec<PathBuf>,
        options: JobOptions,
        output_dir: PathBuf,
        attempt: u32,
        events: Sender<StageEvent>,
        abandoned: Arc<AtomicBool>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            upload_ids,
            video_paths,
            options,
            output_dir,
            attempt,
            events,
            abandoned,
        }
    }

    /// Reports how far along this stage is. Values are clamped to [0, 1].
    pub fn report_progress(&self, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        // The runner may have stopped listening; progress is advisory.
        let _ = self.events.send(StageEvent::Progress(fraction.clamp(0.0, 1.0)));
    }

    /// Set once the runner gave up on this attempt (timeout or shutdown).
    /// Long-running stages should poll it and stop early.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Relaxed)
    }
}

/// One step of the analysis pipeline.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_serde() {
        for kind in StageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_disabled_by_options() {
        let options = JobOptions {
            auto_transcribe: false,
            diarize: true,
            language_hint: None,
        };
        assert!(StageKind::Transcribe.is_disabled_by(&options));
        assert!(!StageKind::Diarize.is_disabled_by(&options));
        assert!(!StageKind::ExtractEntities.is_disabled_by(&JobOptions::default()));
    }

    #[test]
    fn test_report_progress_clamps() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = StageContext::new(
            "j1",
            StageKind::Diarize,
            vec![],
            vec![],
            JobOptions::default(),
            PathBuf::from("/tmp"),
            1,
            tx,
            Arc::new(AtomicBool::new(false)),
        );

        ctx.report_progress(1.7);
        ctx.report_progress(f64::NAN);
        ctx.report_progress(-0.2);

        let values: Vec<f64> = rx
            .try_iter()
            .filter_map(|e| match e {
                StageEvent::Progress(p) => Some(p),
                StageEvent::Finished(_) => None,
            })
            .collect();
        assert_eq!(values, vec![1.0, 0.0]);
        assert!(!ctx.is_abandoned());
    }
}
