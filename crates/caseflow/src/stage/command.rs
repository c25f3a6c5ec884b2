//! Stage backed by an external analysis executable.
//!
//! The job is described to the child through `CASEFLOW_*` environment
//! variables. The child reports back on stdout, one JSON object per line:
//!
//! ```text
//! {"progress": 0.4}
//! {"artifact": {"name": "transcript", "location": "transcript.json"}}
//! ```
//!
//! Any other line is treated as diagnostic output.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ProducedArtifact, Stage, StageContext, StageKind, StageOutput};
use crate::config::StageConfig;
use crate::error::StageError;

/// How often the abandonment flag is checked while the child is silent.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes of stderr kept for the failure message.
const STDERR_TAIL: usize = 2_000;

#[derive(Debug, Deserialize)]
struct StageMessage {
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    artifact: Option<ProducedArtifact>,
}

pub struct CommandStage {
    kind: StageKind,
    command: String,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(kind: StageKind, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self::new(config.kind, config.command.clone(), config.args.clone())
    }

    fn build_command(&self, ctx: &StageContext) -> Result<Command, StageError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(&ctx.output_dir)
            .env("CASEFLOW_JOB_ID", &ctx.job_id)
            .env("CASEFLOW_STAGE", ctx.kind.as_str())
            .env("CASEFLOW_OUTPUT_DIR", &ctx.output_dir)
            .env("CASEFLOW_VIDEO_PATHS", self.env_json(&ctx.video_paths)?)
            .env("CASEFLOW_UPLOAD_IDS", self.env_json(&ctx.upload_ids)?)
            .env("CASEFLOW_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref hint) = ctx.options.language_hint {
            cmd.env("CASEFLOW_LANGUAGE_HINT", hint);
        }
        Ok(cmd)
    }

    fn env_json<T: Serialize>(&self, value: &T) -> Result<String, StageError> {
        serde_json::to_string(value).map_err(|e| StageError::Spawn {
            command: self.command.clone(),
            reason: e.to_string(),
        })
    }

    fn handle_line(&self, ctx: &StageContext, line: &str, artifacts: &mut Vec<ProducedArtifact>) {
        let message = match serde_json::from_str::<StageMessage>(line.trim()) {
            Ok(message) => message,
            Err(_) => {
                debug!(stage = %self.kind, "{}", line);
                return;
            }
        };
        if let Some(progress) = message.progress {
            ctx.report_progress(progress);
        }
        if let Some(artifact) = message.artifact {
            artifacts.push(artifact);
        }
    }
}

impl Stage for CommandStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn run(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let mut child = self
            .build_command(ctx)?
            .spawn()
            .map_err(|e| StageError::Spawn {
                command: self.command.clone(),
                reason: e.to_string(),
            })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StageError::Spawn {
                    command: self.command.clone(),
                    reason: "child stdio was not captured".to_string(),
                });
            }
        };

        let (line_tx, line_rx) = crossbeam_channel::unbounded::<String>();
        let stdout_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if line_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf);
            buf
        });

        let mut artifacts = Vec::new();
        loop {
            if ctx.is_abandoned() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StageError::Abandoned);
            }
            match line_rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => self.handle_line(ctx, &line, &mut artifacts),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait().map_err(|e| StageError::Failed(e.to_string()))?;
        let _ = stdout_reader.join();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(StageError::Failed(format!(
                "{} exited with {}: {}",
                self.command,
                status,
                tail(stderr.trim(), STDERR_TAIL)
            )));
        }

        Ok(StageOutput { artifacts })
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
