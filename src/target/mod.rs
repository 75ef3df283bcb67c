//! Narrow interface to a live target behind a debug probe.
//!
//! The probe's own wire protocol is out of scope; anything able to stop, run, read, write
//! and break on a target can implement [`Target`].

use core::fmt;
use core::time::Duration;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Address;

pub mod script;

/// Register name of the program counter.
pub const PROGRAM_COUNTER: &str = "PC";

/// Breakpoint location, resolved either by us or by the debugger.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Location {
    Address(Address),
    /// Named location resolved by the target-control layer.
    Symbol(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Address(address) => fmt::Display::fmt(address, f),
            Location::Symbol(symbol) => f.write_str(symbol),
        }
    }
}

/// Execution state as reported by the probe.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetState {
    Running,
    Stopped,
    /// The probe has not (yet) been able to determine a state, typically right after reset.
    Unknown,
}

/// Failure reported by the target-control layer.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("connection to target lost: {0}")]
    Unreachable(String),
    #[error("{} is not loaded", .0.display())]
    NotLoaded(PathBuf),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("{0} is not supported by this target")]
    Unsupported(&'static str),
}

/// Target-control service of a debug probe.
///
/// Calls are issued strictly one after the other; an implementation never sees two
/// operations in flight.
#[allow(async_fn_in_trait)]
pub trait Target {
    async fn stop(&mut self) -> Result<(), TargetError>;

    async fn run(&mut self) -> Result<(), TargetError>;

    /// Wait for the target to stop, returning `false` if `timeout` elapsed first.
    async fn wait_for_stop(&mut self, timeout: Duration) -> Result<bool, TargetError>;

    /// Arm a hardware execution breakpoint. A `temporary` one is removed once hit.
    async fn set_breakpoint(
        &mut self,
        location: &Location,
        temporary: bool,
    ) -> Result<(), TargetError>;

    async fn remove_all_breakpoints(&mut self) -> Result<(), TargetError>;

    /// Set the program counter of a halted target.
    async fn set_execution_address(&mut self, address: Address) -> Result<(), TargetError>;

    async fn read_register(&mut self, name: &str) -> Result<u64, TargetError>;

    async fn read_memory32(&mut self, address: Address) -> Result<u32, TargetError>;

    async fn write_memory_block(
        &mut self,
        address: Address,
        bytes: &[u8],
    ) -> Result<(), TargetError>;

    async fn load_symbols(&mut self, path: &Path) -> Result<(), TargetError>;

    /// Fails with [`TargetError::NotLoaded`] if `path` was never loaded.
    async fn unload_symbols(&mut self, path: &Path) -> Result<(), TargetError>;

    async fn reset(&mut self) -> Result<(), TargetError>;

    async fn state(&mut self) -> Result<TargetState, TargetError>;

    /// Let `duration` pass without touching the target.
    async fn idle(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Disassemble the single instruction at `address`.
    async fn disassemble(&mut self, address: Address) -> Result<String, TargetError> {
        let word = self.read_memory32(address).await?;
        Ok(format!(".word 0x{word:08x}"))
    }
}
