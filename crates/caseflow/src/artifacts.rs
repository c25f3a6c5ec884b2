//! Per-job artifact namespaces and artifact records.
//!
//! Every job owns `<artifact_root>/<job_id>/`, with one subdirectory per
//! stage and, below it, one per attempt:
//! `<stage>/run-<recoveries>/attempt-<n>`. An abandoned attempt may still
//! be writing, so no directory is ever handed to a second attempt.
//! Records are append-only: nothing here edits or removes an artifact once
//! it is attached to a job.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{JobError, WorkerError};
use crate::job::{Artifact, Job, Lease};
use crate::stage::{ProducedArtifact, StageKind};
use crate::store::JobStore;

#[derive(Clone)]
pub struct ArtifactRegistry {
    root: PathBuf,
    store: JobStore,
}

impl ArtifactRegistry {
    pub fn new(root: impl Into<PathBuf>, store: JobStore) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory exclusive to one job.
    pub fn namespace(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn stage_dir(&self, job_id: &str, kind: StageKind) -> PathBuf {
        self.namespace(job_id).join(kind.as_str())
    }

    /// Output directory of attempt `number` made while the job had been
    /// recovered `recoveries` times.
    pub fn attempt_dir(&self, job_id: &str, kind: StageKind, recoveries: u32, number: u32) -> PathBuf {
        self.stage_dir(job_id, kind)
            .join(format!("run-{}", recoveries))
            .join(format!("attempt-{}", number))
    }

    /// Creates the empty output directory of one stage attempt.
    pub fn prepare_attempt_dir(
        &self,
        job_id: &str,
        kind: StageKind,
        recoveries: u32,
        number: u32,
    ) -> Result<PathBuf, WorkerError> {
        let dir = self.attempt_dir(job_id, kind, recoveries, number);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| WorkerError::ArtifactDir {
                path: dir.clone(),
                source: e,
            })?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| WorkerError::ArtifactDir {
            path: dir.clone(),
            source: e,
        })?;
        Ok(dir)
    }

    /// Records one artifact on a running job held by `lease`.
    pub fn register(
        &self,
        lease: &Lease,
        name: &str,
        location: &str,
        stage: StageKind,
    ) -> Result<Artifact, JobError> {
        let produced = [ProducedArtifact::new(name, location)];
        let dir = self.stage_dir(&lease.job_id, stage);
        let job = self
            .store
            .update_leased(lease, |job| attach(job, stage, &dir, &produced))
            .map_err(|e| match e {
                JobError::Terminal(id) => {
                    JobError::Validation(format!("job {} is terminal; artifacts are frozen", id))
                }
                JobError::LeaseLost(id) => JobError::Validation(format!(
                    "worker {} does not hold the lease on job {}",
                    lease.owner, id
                )),
                other => other,
            })?;

        job.artifacts
            .into_iter()
            .rev()
            .find(|a| a.name == name)
            .ok_or_else(|| JobError::NotFound(format!("{}/{}", lease.job_id, name)))
    }

    pub fn list(&self, job_id: &str) -> Result<Vec<Artifact>, JobError> {
        Ok(self.store.get(job_id)?.artifacts)
    }
}

/// Appends `produced` to `job` as artifacts of `stage`.
///
/// Relative locations are resolved against `stage_dir`. Meant to run inside
/// a job store mutator, so a rejected name leaves the job untouched.
pub fn attach(
    job: &mut Job,
    stage: StageKind,
    stage_dir: &Path,
    produced: &[ProducedArtifact],
) -> Result<(), JobError> {
    let now = Utc::now();
    for artifact in produced {
        let name = artifact.name.trim();
        if name.is_empty() {
            return Err(JobError::Validation(format!(
                "stage {} produced an artifact without a name",
                stage
            )));
        }
        if job.has_artifact(name) {
            return Err(JobError::Validation(format!(
                "artifact '{}' is already registered on job {}",
                name, job.job_id
            )));
        }

        let location = Path::new(&artifact.location);
        let location = if location.is_absolute() {
            location.to_path_buf()
        } else {
            stage_dir.join(location)
        };

        job.artifacts.push(Artifact {
            name: name.to_string(),
            location: location.display().to_string(),
            stage: stage.as_str().to_string(),
            produced_at: now,
        });
    }
    Ok(())
}
