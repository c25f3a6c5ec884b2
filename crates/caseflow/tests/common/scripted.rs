//! Stand-in analysis stages with scripted behaviour.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use caseflow::stage::ProducedArtifact;
use caseflow::{Stage, StageContext, StageError, StageKind, StageOutput};

#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Writes `<kind>.json` into the output directory and reports it.
    Succeed,
    /// Like `Succeed`, after sleeping.
    SucceedAfter(Duration),
    /// Fails every attempt.
    Fail,
    /// Reports this fraction of its work done, then fails every attempt.
    FailAfterProgress(f64),
    /// Blocks until the runner abandons the attempt.
    Hang,
}

pub struct ScriptedStage {
    kind: StageKind,
    behaviour: Behaviour,
    runs: AtomicU32,
    abandoned: AtomicU32,
}

impl ScriptedStage {
    pub fn new(kind: StageKind, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behaviour,
            runs: AtomicU32::new(0),
            abandoned: AtomicU32::new(0),
        })
    }

    /// One stage per `StageKind`, in pipeline order.
    pub fn pipeline(script: [Behaviour; 4]) -> Vec<Arc<Self>> {
        StageKind::ALL
            .iter()
            .zip(script)
            .map(|(kind, behaviour)| Self::new(*kind, behaviour))
            .collect()
    }

    pub fn all_succeed() -> Vec<Arc<Self>> {
        Self::pipeline([Behaviour::Succeed; 4])
    }

    /// Number of attempts started.
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of attempts that noticed they were abandoned.
    pub fn abandoned(&self) -> u32 {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn produce(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let file = format!("{}.json", self.kind);
        let body = format!(r#"{{"job_id":"{}","attempt":{}}}"#, ctx.job_id, ctx.attempt);
        std::fs::write(ctx.output_dir.join(&file), body)
            .map_err(|e| StageError::Failed(e.to_string()))?;
        ctx.report_progress(1.0);
        Ok(StageOutput {
            artifacts: vec![ProducedArtifact::new(self.kind.as_str(), file)],
        })
    }
}

impl Stage for ScriptedStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Succeed => self.produce(ctx),
            Behaviour::SucceedAfter(delay) => {
                ctx.report_progress(0.5);
                thread::sleep(delay);
                self.produce(ctx)
            }
            Behaviour::Fail => Err(StageError::Failed(format!("{} exploded", self.kind))),
            Behaviour::FailAfterProgress(fraction) => {
                ctx.report_progress(fraction);
                thread::sleep(Duration::from_millis(20));
                Err(StageError::Failed(format!("{} exploded late", self.kind)))
            }
            Behaviour::Hang => {
                while !ctx.is_abandoned() {
                    thread::sleep(Duration::from_millis(10));
                }
                self.abandoned.fetch_add(1, Ordering::SeqCst);
                Err(StageError::Abandoned)
            }
        }
    }
}
