//! Full boot sequences built from a table of stages.
//!
//! The first stage is injected with the target halted at its entry, typically right after
//! reset. Every later stage is intercepted with [`advance_to_stage`], in table order.

use core::time::Duration;

use log::{error, info, warn};

use crate::{
    Address, EntryLocator, Error, Stage, StageError, Step, Target, TargetSession, TargetState,
    sequencer::{self, DEFAULT_TIMEOUT, Transition, advance_to_stage},
};

#[derive(Clone, Debug)]
pub struct Options {
    /// Reset the target before injecting the first stage.
    pub reset_first: bool,
    /// Per-stage bound on waiting for the entry breakpoint.
    pub timeout: Duration,
    /// Interval between state polls after reset.
    pub poll_interval: Duration,
    /// Number of state polls after reset before giving up on a settled state.
    pub poll_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reset_first: false,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            poll_attempts: 10,
        }
    }
}

/// How the target came out of reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResetStatus {
    /// A known state was reported on poll number `polls`.
    Settled { polls: u32 },
    /// The state stayed unknown; the sequence went on regardless.
    Unsettled,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Completion {
    pub stage: String,
    pub transition: Transition,
}

#[derive(Debug)]
pub enum Outcome {
    /// Every stage was injected.
    Finished,
    /// `stage` was never reached; the remaining stages were skipped.
    TimedOut { stage: String },
    /// The sequence stopped at a failure. The target is left halted.
    Failed(StageError),
}

#[derive(Debug)]
pub struct Report {
    pub reset: Option<ResetStatus>,
    pub completed: Vec<Completion>,
    pub outcome: Outcome,
}

impl Report {
    pub fn last_completed(&self) -> Option<&Completion> {
        self.completed.last()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.outcome, Outcome::Finished)
    }
}

/// Boot the target through `stages`, injecting each one in turn.
///
/// Artifacts and entries of all stages are checked before the target is touched; a problem
/// there is returned as an error. Everything after that ends up in the [`Report`].
pub async fn run_sequence<T: Target>(
    session: &mut TargetSession<T>,
    stages: &[Stage],
    options: &Options,
) -> Result<Report, StageError> {
    preflight(stages)?;

    let mut report = Report {
        reset: None,
        completed: Vec::new(),
        outcome: Outcome::Finished,
    };
    let Some((first, rest)) = stages.split_first() else {
        return Ok(report);
    };

    if options.reset_first {
        match reset(session, options).await {
            Ok(status) => report.reset = Some(status),
            Err(e) => {
                report.outcome = Outcome::Failed(StageError::new(&first.name, Step::Reset, e));
                return Ok(report);
            }
        }
    }

    match load_at_entry(session, first).await {
        Ok(address) => report.completed.push(Completion {
            stage: first.name.clone(),
            transition: Transition::Completed { address },
        }),
        Err(e) => {
            error!("{e}");
            report.outcome = Outcome::Failed(e);
            return Ok(report);
        }
    }

    for stage in rest {
        match advance_to_stage(session, stage, options.timeout).await {
            Ok(Transition::TimedOut) => {
                warn!(
                    "{}: not reached, stopping the sequence after {}",
                    stage.name,
                    report.last_completed().map_or("nothing", |c| c.stage.as_str())
                );
                report.outcome = Outcome::TimedOut {
                    stage: stage.name.clone(),
                };
                break;
            }
            Ok(transition) => report.completed.push(Completion {
                stage: stage.name.clone(),
                transition,
            }),
            Err(e) => {
                error!("{e}");
                report.outcome = Outcome::Failed(e);
                break;
            }
        }
    }

    Ok(report)
}

/// Inject `stage` at its fixed entry without running the target.
///
/// The target is stopped, all breakpoints are cleared and the program counter is set to the
/// entry before the stage is loaded.
pub async fn load_at_entry<T: Target>(
    session: &mut TargetSession<T>,
    stage: &Stage,
) -> Result<Address, StageError> {
    let EntryLocator::Absolute(entry) = &stage.entry else {
        return Err(StageError::new(
            &stage.name,
            Step::ResolveEntry,
            Error::FirstStageEntry(stage.entry.clone()),
        ));
    };

    session
        .stop()
        .await
        .map_err(StageError::at(stage, Step::Stop))?;
    session
        .clear_breakpoints()
        .await
        .map_err(StageError::at(stage, Step::ClearBreakpoints))?;
    session
        .set_execution_address(*entry)
        .await
        .map_err(StageError::at(stage, Step::SetExecutionAddress))?;
    info!("{}: execution address set to {entry}", stage.name);

    sequencer::inject(session, stage).await
}

/// Reset the target and poll until it reports a known state.
///
/// A state that stays unknown is only worth a warning; some boards are slow to report.
pub async fn reset<T: Target>(
    session: &mut TargetSession<T>,
    options: &Options,
) -> Result<ResetStatus, Error> {
    info!("resetting target");
    session.reset().await?;

    for poll in 1..=options.poll_attempts {
        session.target_mut().idle(options.poll_interval).await;
        let state = session.target_mut().state().await?;
        if state != TargetState::Unknown {
            info!("target {state:?} after reset");
            return Ok(ResetStatus::Settled { polls: poll });
        }
    }

    warn!(
        "target state still unknown after {} polls, continuing",
        options.poll_attempts
    );
    Ok(ResetStatus::Unsettled)
}

fn preflight(stages: &[Stage]) -> Result<(), StageError> {
    for (index, stage) in stages.iter().enumerate() {
        let fail = StageError::at(stage, Step::CheckArtifacts);
        match (index, &stage.entry) {
            (0, EntryLocator::Absolute(_)) => {}
            (0, entry) => return Err(fail(Error::FirstStageEntry(entry.clone()))),
            (_, EntryLocator::CurrentPc) => return Err(fail(Error::AmbiguousEntry)),
            _ => {}
        }

        if let Err(source) = std::fs::metadata(&stage.symbols) {
            return Err(fail(Error::ArtifactNotFound {
                path: stage.symbols.clone(),
                source,
            }));
        }
        match std::fs::metadata(&stage.image) {
            Ok(meta) if meta.len() == 0 => return Err(fail(Error::EmptyImage(stage.image.clone()))),
            Ok(_) => {}
            Err(source) => {
                return Err(fail(Error::ArtifactNotFound {
                    path: stage.image.clone(),
                    source,
                }));
            }
        }
    }
    Ok(())
}
