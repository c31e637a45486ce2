//! Save/compile state machine of a document session.
//!
//! [`Phase::on`] is a pure function from the current phase and an input to
//! the next phase. Inputs that make no sense in the current phase are
//! rejected with [`InvalidTransition`] and leave the caller's phase as it
//! was; the session is the only place that stores a phase, and it only ever
//! stores what `on` returns.

use chrono::Utc;
use quire_core::types::Timestamp;
use quire_events::{Diagnostic, Envelope, Progress};
use serde::Serialize;

/// Outcome of a finished compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    /// Full compiler log, when the server sent one.
    pub log: Option<String>,
    pub message: Option<String>,
    pub finished_at: Timestamp,
}

impl CompileReport {
    /// Build a report from a terminal compilation envelope.
    ///
    /// A failure without parseable errors gets the top-level `message` (or
    /// `error`) as its single diagnostic, so it never reports zero errors.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let result = envelope.compile_result().unwrap_or_default();
        let message = envelope.message().or_else(|| {
            envelope
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

        let mut errors = result.errors;
        if errors.is_empty() && envelope.reports_failure() {
            errors.push(Diagnostic {
                message: message
                    .clone()
                    .unwrap_or_else(|| "Compilation failed".to_string()),
                line: None,
            });
        }

        Self {
            errors,
            warnings: result.warnings,
            log: result.log,
            message,
            finished_at: Utc::now(),
        }
    }
}

/// Where a session is in its save/compile cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Saving,
    /// A compile request is out; carries the latest progress report.
    Compiling(Progress),
    Success(CompileReport),
    Failed(CompileReport),
}

/// Things that move a [`Phase`].
#[derive(Debug, Clone)]
pub enum PhaseInput {
    SaveStarted,
    SaveSucceeded,
    SaveFailed,
    CompileStarted,
    /// The compile POST itself failed.
    CompileRejected,
    CompileProgress(Progress),
    CompileSucceeded(CompileReport),
    CompileFailed(CompileReport),
    /// Leave a momentary `Success`/`Failed` display state.
    Settle,
    /// Unmount or restore.
    Teardown,
}

impl PhaseInput {
    fn name(&self) -> &'static str {
        match self {
            Self::SaveStarted => "save_started",
            Self::SaveSucceeded => "save_succeeded",
            Self::SaveFailed => "save_failed",
            Self::CompileStarted => "compile_started",
            Self::CompileRejected => "compile_rejected",
            Self::CompileProgress(_) => "compile_progress",
            Self::CompileSucceeded(_) => "compile_succeeded",
            Self::CompileFailed(_) => "compile_failed",
            Self::Settle => "settle",
            Self::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid phase transition: '{input}' while {phase}")]
pub struct InvalidTransition {
    pub phase: &'static str,
    pub input: &'static str,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Saving => "saving",
            Self::Compiling(_) => "compiling",
            Self::Success(_) => "success",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_compiling(&self) -> bool {
        matches!(self, Self::Compiling(_))
    }

    /// `Success` or `Failed`: a compile outcome still on display.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failed(_))
    }

    /// Next phase for `input`.
    pub fn on(&self, input: PhaseInput) -> Result<Phase, InvalidTransition> {
        use PhaseInput as I;

        let next = match (self, input) {
            (_, I::Teardown) => Phase::Idle,

            (Phase::Idle, I::SaveStarted) => Phase::Saving,
            (Phase::Saving, I::SaveSucceeded | I::SaveFailed) => Phase::Idle,

            (Phase::Idle, I::CompileStarted) => Phase::Compiling(Progress::default()),
            (Phase::Compiling(_), I::CompileRejected) => Phase::Idle,
            (Phase::Compiling(previous), I::CompileProgress(update)) => {
                Phase::Compiling(Progress {
                    stage: update.stage.or_else(|| previous.stage.clone()),
                    percent: update.percent.or(previous.percent),
                    message: update.message.or_else(|| previous.message.clone()),
                })
            }
            (Phase::Compiling(_), I::CompileSucceeded(report)) => Phase::Success(report),
            (Phase::Compiling(_), I::CompileFailed(report)) => Phase::Failed(report),

            (Phase::Success(_) | Phase::Failed(_), I::Settle) => Phase::Idle,

            (phase, input) => {
                return Err(InvalidTransition {
                    phase: phase.name(),
                    input: input.name(),
                })
            }
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn report() -> CompileReport {
        CompileReport {
            errors: vec![],
            warnings: vec![Diagnostic {
                message: "Overfull hbox".into(),
                line: Some(3),
            }],
            log: None,
            message: None,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn save_cycle_returns_to_idle() {
        let saving = Phase::Idle.on(PhaseInput::SaveStarted).unwrap();
        assert_eq!(saving, Phase::Saving);
        assert_eq!(saving.on(PhaseInput::SaveSucceeded).unwrap(), Phase::Idle);
        assert_eq!(
            Phase::Saving.on(PhaseInput::SaveFailed).unwrap(),
            Phase::Idle
        );
    }

    #[test]
    fn compile_cycle_settles_to_idle() {
        let compiling = Phase::Idle.on(PhaseInput::CompileStarted).unwrap();
        assert!(compiling.is_compiling());

        let done = compiling
            .on(PhaseInput::CompileSucceeded(report()))
            .unwrap();
        assert_matches!(&done, Phase::Success(r) if r.warnings.len() == 1);
        assert_eq!(done.on(PhaseInput::Settle).unwrap(), Phase::Idle);

        let failed = Phase::Compiling(Progress::default())
            .on(PhaseInput::CompileFailed(report()))
            .unwrap();
        assert_eq!(failed.on(PhaseInput::Settle).unwrap(), Phase::Idle);
    }

    #[test]
    fn progress_merges_into_compiling_payload() {
        let phase = Phase::Idle
            .on(PhaseInput::CompileStarted)
            .unwrap()
            .on(PhaseInput::CompileProgress(Progress {
                stage: Some("bibtex".into()),
                percent: Some(30),
                message: None,
            }))
            .unwrap()
            .on(PhaseInput::CompileProgress(Progress {
                stage: None,
                percent: Some(70),
                message: Some("second pass".into()),
            }))
            .unwrap();

        assert_eq!(
            phase,
            Phase::Compiling(Progress {
                stage: Some("bibtex".into()),
                percent: Some(70),
                message: Some("second pass".into()),
            })
        );
    }

    #[test]
    fn teardown_is_accepted_from_every_phase() {
        for phase in [
            Phase::Idle,
            Phase::Saving,
            Phase::Compiling(Progress::default()),
            Phase::Success(report()),
            Phase::Failed(report()),
        ] {
            assert_eq!(phase.on(PhaseInput::Teardown).unwrap(), Phase::Idle);
        }
    }

    #[test]
    fn out_of_order_inputs_are_rejected() {
        assert_eq!(
            Phase::Saving.on(PhaseInput::CompileStarted).unwrap_err(),
            InvalidTransition {
                phase: "saving",
                input: "compile_started"
            }
        );
        assert!(Phase::Idle
            .on(PhaseInput::CompileSucceeded(report()))
            .is_err());
        assert!(Phase::Compiling(Progress::default())
            .on(PhaseInput::SaveStarted)
            .is_err());
        assert!(Phase::Idle.on(PhaseInput::Settle).is_err());
    }

    #[test]
    fn failure_without_result_keeps_message_as_diagnostic() {
        let env = quire_events::decode_envelope(
            r#"{"job_id":"doc-1","type":"compilation_failed","message":"pdflatex not found"}"#,
        )
        .unwrap();
        let report = CompileReport::from_envelope(&env);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].message, "pdflatex not found");
    }

    #[test]
    fn unsuccessful_completion_never_reports_zero_errors() {
        let env = quire_events::decode_envelope(
            r#"{"job_id":"doc-1","type":"compilation_completed","result":{"success":false,"log":"..."}}"#,
        )
        .unwrap();
        let report = CompileReport::from_envelope(&env);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].message, "Compilation failed");
        assert_eq!(report.log.as_deref(), Some("..."));
    }

    #[test]
    fn successful_completion_has_no_fallback_error() {
        let env = quire_events::decode_envelope(
            r#"{"job_id":"doc-1","type":"compilation_completed","result":{"success":true}}"#,
        )
        .unwrap();
        assert!(CompileReport::from_envelope(&env).errors.is_empty());
    }
}
