//! A single stage transition: run the target into a stage's entry and replace the stage.
//!
//! The pipeline is
//!
//! 1. resolve the entry to a breakpoint location,
//! 2. arm a temporary hardware breakpoint there,
//! 3. resume the target,
//! 4. wait for it to stop, bounded by a timeout,
//! 5. reload the stage's symbols and write its image.
//!
//! A timeout is not an error: the target is forcibly stopped and [`Transition::TimedOut`] is
//! returned, so the caller can decide between retrying and giving up.
//!
//! Once the target has run past an entry, its breakpoint is never hit again. Stages must be
//! advanced in the order in which the target executes them.

use core::time::Duration;

use log::{debug, info, warn};

use crate::{
    Address, EntryLocator, Error, Location, Stage, StageError, Step, Target, TargetError,
    TargetSession, TargetState, image, symbols, target::PROGRAM_COUNTER,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a transition that did not fail.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transition {
    /// The breakpoint was hit and the image was written at `address`.
    Completed { address: Address },
    /// The target was already halted at the entry, so no run was needed.
    AlreadyLoaded { address: Address },
    /// The breakpoint was not hit in time. A forced stop has been attempted.
    TimedOut,
}

/// Run the target up to the entry of `stage` and inject the stage there.
///
/// Breakpoints armed earlier are left alone; clearing them is up to whoever starts a fresh
/// sequence.
pub async fn advance_to_stage<T: Target>(
    session: &mut TargetSession<T>,
    stage: &Stage,
    timeout: Duration,
) -> Result<Transition, StageError> {
    let location = resolve_entry(session, &stage.entry)
        .await
        .map_err(StageError::at(stage, Step::ResolveEntry))?;

    if let Location::Address(entry) = &location {
        if halted_at(session, *entry)
            .await
            .map_err(StageError::at(stage, Step::ResolveEntry))?
        {
            info!("{}: already halted at {entry}", stage.name);
            let address = inject(session, stage).await?;
            return Ok(Transition::AlreadyLoaded { address });
        }
    }

    session
        .arm(&location)
        .await
        .map_err(StageError::at(stage, Step::ArmBreakpoint))?;
    session
        .run()
        .await
        .map_err(StageError::at(stage, Step::Run))?;
    info!("{}: running to {location}", stage.name);

    let stopped = match session.target_mut().wait_for_stop(timeout).await {
        Ok(stopped) => stopped,
        Err(e @ TargetError::Unreachable(_)) => {
            return Err(StageError::new(&stage.name, Step::WaitForStop, e));
        }
        Err(e) => {
            force_stop(session, stage).await;
            return Err(StageError::new(&stage.name, Step::WaitForStop, e));
        }
    };

    if !stopped {
        warn!(
            "{}: timed out after {} waiting for {location}",
            stage.name,
            humantime::format_duration(timeout)
        );
        force_stop(session, stage).await;
        return Ok(Transition::TimedOut);
    }

    session.hit(&location);
    info!("{}: stopped at {location}", stage.name);

    let address = inject(session, stage).await?;
    Ok(Transition::Completed { address })
}

/// Reload the symbols of a halted `stage` and write its image, returning the load address.
pub(crate) async fn inject<T: Target>(
    session: &mut TargetSession<T>,
    stage: &Stage,
) -> Result<Address, StageError> {
    symbols::reload(session, &stage.symbols)
        .await
        .map_err(StageError::at(stage, Step::ReloadSymbols))?;

    let address = image::load_address(session, stage)
        .await
        .map_err(StageError::at(stage, Step::ReadProgramCounter))?;
    info!(
        "loading {} image from {} @ {address}",
        stage.name,
        stage.image.display()
    );
    image::load_binary(session, &stage.image, address)
        .await
        .map_err(StageError::at(stage, Step::WriteImage))?;

    Ok(address)
}

async fn force_stop<T: Target>(session: &mut TargetSession<T>, stage: &Stage) {
    if let Err(e) = session.stop().await {
        warn!("{}: forced stop failed: {e}", stage.name);
    }
}

async fn resolve_entry<T: Target>(
    session: &mut TargetSession<T>,
    entry: &EntryLocator,
) -> Result<Location, Error> {
    Ok(match entry {
        EntryLocator::Absolute(address) => Location::Address(*address),
        EntryLocator::Symbol(symbol) => Location::Symbol(symbol.clone()),
        EntryLocator::CurrentPc => {
            Location::Address(Address::new(image::program_counter(session).await?))
        }
    })
}

/// Whether the target is halted exactly at `address`.
///
/// The session must have halted the target at `address` itself, address space included, since
/// the program counter alone cannot tell `S:0x60000000` from `N:0x60000000`. A target that
/// cannot report its program counter is treated as not being there.
async fn halted_at<T: Target>(
    session: &mut TargetSession<T>,
    address: Address,
) -> Result<bool, TargetError> {
    if session.halted_at() != Some(address) {
        return Ok(false);
    }
    if session.target_mut().state().await? != TargetState::Stopped {
        return Ok(false);
    }

    match session.target_mut().read_register(PROGRAM_COUNTER).await {
        Ok(pc) => Ok(pc == address.offset),
        Err(e @ TargetError::Unreachable(_)) => Err(e),
        Err(e) => {
            debug!("program counter unavailable: {e}");
            Ok(false)
        }
    }
}
