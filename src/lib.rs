//! Toolkit for injecting freshly built boot stages into a target held by a debug probe.
//!
//! A boot stage is intercepted by arming a hardware breakpoint at its entry, letting the
//! target run into it, and then overwriting the stage's image in target memory before
//! execution resumes. See [`sequencer::advance_to_stage`] for a single transition and
//! [`orchestrator::run_sequence`] for a full boot.

use core::fmt;
use core::str::FromStr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod image;
pub mod orchestrator;
pub mod sequencer;
pub mod session;
pub mod symbols;
pub mod target;

#[cfg(test)]
mod mock;

pub use session::TargetSession;
pub use target::{Location, Target, TargetError, TargetState};

/// Address space an address is qualified with, as understood by the debugger.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub enum AddressSpace {
    /// Whatever space the current execution context uses.
    #[default]
    Current,
    /// Secure world, written `S:`.
    Secure,
    /// Non-secure world, written `N:`.
    NonSecure,
}

/// Target address, optionally qualified with an address space.
///
/// Written as `0x00100000`, `S:0x60000000` or `N:0x60080000`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub space: AddressSpace,
    pub offset: u64,
}

impl Address {
    pub const fn new(offset: u64) -> Self {
        Self {
            space: AddressSpace::Current,
            offset,
        }
    }

    pub const fn secure(offset: u64) -> Self {
        Self {
            space: AddressSpace::Secure,
            offset,
        }
    }

    pub const fn non_secure(offset: u64) -> Self {
        Self {
            space: AddressSpace::NonSecure,
            offset,
        }
    }

    /// Same address space, different offset.
    pub const fn with_offset(self, offset: u64) -> Self {
        Self {
            space: self.space,
            offset,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space {
            AddressSpace::Current => {}
            AddressSpace::Secure => f.write_str("S:")?,
            AddressSpace::NonSecure => f.write_str("N:")?,
        }
        write!(f, "0x{:08x}", self.offset)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid address `{0}`")]
pub struct ParseAddressError(String);

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseAddressError(s.to_owned());
        let trimmed = s.trim();

        let (space, number) = match trimmed.split_once(':') {
            Some(("S" | "s", number)) => (AddressSpace::Secure, number),
            Some(("N" | "n", number)) => (AddressSpace::NonSecure, number),
            Some(_) => return Err(invalid()),
            None => (AddressSpace::Current, trimmed),
        };

        let offset = match number
            .strip_prefix("0x")
            .or_else(|| number.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => number.parse(),
        }
        .map_err(|_| invalid())?;

        Ok(Self { space, offset })
    }
}

impl TryFrom<String> for Address {
    type Error = ParseAddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// Where a stage begins executing.
///
/// Parses from text: an address form is [`EntryLocator::Absolute`], the literal `pc` is
/// [`EntryLocator::CurrentPc`] and anything else names a symbol the debugger resolves.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntryLocator {
    Absolute(Address),
    Symbol(String),
    /// Wherever the target currently is.
    ///
    /// A target already stopped past the intended point is indistinguishable from one that
    /// just arrived, so sequences refuse this form for anything but direct API use.
    CurrentPc,
}

impl fmt::Display for EntryLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryLocator::Absolute(address) => fmt::Display::fmt(address, f),
            EntryLocator::Symbol(symbol) => f.write_str(symbol),
            EntryLocator::CurrentPc => f.write_str("pc"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("entry locator must not be empty")]
pub struct ParseEntryError;

impl FromStr for EntryLocator {
    type Err = ParseEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseEntryError);
        }
        if s.eq_ignore_ascii_case("pc") {
            return Ok(EntryLocator::CurrentPc);
        }

        Ok(match s.parse::<Address>() {
            Ok(address) => EntryLocator::Absolute(address),
            Err(_) => EntryLocator::Symbol(s.to_owned()),
        })
    }
}

impl TryFrom<String> for EntryLocator {
    type Error = ParseEntryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryLocator> for String {
    fn from(value: EntryLocator) -> Self {
        value.to_string()
    }
}

/// A boot firmware component to intercept and replace.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Stage {
    pub name: String,
    pub entry: EntryLocator,
    /// Debug symbols (ELF) for the stage.
    pub symbols: PathBuf,
    /// Raw binary image written into target memory.
    pub image: PathBuf,
    /// Where the image goes. Defaults to the address the target is stopped at.
    pub load_address: Option<Address>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        entry: EntryLocator,
        symbols: impl Into<PathBuf>,
        image: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            entry,
            symbols: symbols.into(),
            image: image.into(),
            load_address: None,
        }
    }

    pub fn with_load_address(mut self, address: Address) -> Self {
        self.load_address = Some(address);
        self
    }
}

/// Operation being attempted when a stage transition fails.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    CheckArtifacts,
    Reset,
    Stop,
    ClearBreakpoints,
    SetExecutionAddress,
    ResolveEntry,
    ArmBreakpoint,
    Run,
    WaitForStop,
    ReloadSymbols,
    ReadProgramCounter,
    WriteImage,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::CheckArtifacts => "checking artifacts",
            Step::Reset => "resetting target",
            Step::Stop => "stopping target",
            Step::ClearBreakpoints => "clearing breakpoints",
            Step::SetExecutionAddress => "setting execution address",
            Step::ResolveEntry => "resolving entry",
            Step::ArmBreakpoint => "arming breakpoint",
            Step::Run => "running target",
            Step::WaitForStop => "waiting for stop",
            Step::ReloadSymbols => "reloading symbols",
            Step::ReadProgramCounter => "reading program counter",
            Step::WriteImage => "writing image",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Probe or connection lost.
    #[error("target unreachable: {0}")]
    TargetUnreachable(String),
    #[error("loading symbols from {} failed", path.display())]
    SymbolReloadFailed {
        path: PathBuf,
        #[source]
        source: TargetError,
    },
    #[error("writing {} at {address} failed", path.display())]
    ImageWriteFailed {
        path: PathBuf,
        address: Address,
        #[source]
        source: TargetError,
    },
    #[error("artifact {} not found", path.display())]
    ArtifactNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image {} is empty", .0.display())]
    EmptyImage(PathBuf),
    #[error("program counter unavailable")]
    ProgramCounterUnavailable(#[source] TargetError),
    #[error("entry `pc` cannot be told apart from a stale stop")]
    AmbiguousEntry,
    #[error("first stage must enter at an absolute address, not `{0}`")]
    FirstStageEntry(EntryLocator),
    #[error(transparent)]
    Target(TargetError),
}

impl Error {
    /// Whether the failure came from the target rather than from a stage's artifacts or
    /// entry configuration.
    pub fn is_target_fault(&self) -> bool {
        !matches!(
            self,
            Error::ArtifactNotFound { .. }
                | Error::EmptyImage(_)
                | Error::AmbiguousEntry
                | Error::FirstStageEntry(_)
        )
    }
}

impl From<TargetError> for Error {
    fn from(value: TargetError) -> Self {
        match value {
            TargetError::Unreachable(detail) => Error::TargetUnreachable(detail),
            other => Error::Target(other),
        }
    }
}

/// Failure of a stage transition, tagged with the stage and the step that failed.
#[derive(Debug, Error)]
#[error("{stage}: {step} failed")]
pub struct StageError {
    pub stage: String,
    pub step: Step,
    #[source]
    pub error: Error,
}

impl StageError {
    pub fn new(stage: &str, step: Step, error: impl Into<Error>) -> Self {
        Self {
            stage: stage.to_owned(),
            step,
            error: error.into(),
        }
    }

    /// Adapter for `map_err` at a given step of `stage`.
    pub(crate) fn at<E: Into<Error>>(stage: &Stage, step: Step) -> impl FnOnce(E) -> Self {
        let name = stage.name.clone();
        move |error| Self {
            stage: name,
            step,
            error: error.into(),
        }
    }
}
