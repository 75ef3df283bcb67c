//! One live connection to a target.

use crate::{Address, Location, Target, TargetError, symbols::SymbolStore};

/// Live debug session, the single owner of target state.
///
/// Besides the target itself the session records which symbol files are loaded, which
/// breakpoints are armed and where the target was last halted by us. All target mutation goes
/// through a session, so these records stay in step with what the probe was told.
pub struct TargetSession<T> {
    target: T,
    symbols: SymbolStore,
    breakpoints: Vec<Location>,
    halted_at: Option<Address>,
}

impl<T: Target> TargetSession<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            symbols: SymbolStore::default(),
            breakpoints: Vec::new(),
            halted_at: None,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub(crate) fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn symbols(&self) -> &SymbolStore {
        &self.symbols
    }

    pub(crate) fn symbols_mut(&mut self) -> &mut SymbolStore {
        &mut self.symbols
    }

    /// Breakpoints armed through this session that have not been hit or cleared.
    pub fn armed_breakpoints(&self) -> &[Location] {
        &self.breakpoints
    }

    /// Address, space included, the target was halted at by this session.
    ///
    /// Only known after setting the execution address or stopping at an absolute breakpoint,
    /// and forgotten as soon as the target runs or is reset.
    pub fn halted_at(&self) -> Option<Address> {
        self.halted_at
    }

    pub async fn stop(&mut self) -> Result<(), TargetError> {
        self.target.stop().await
    }

    pub async fn read_memory32(&mut self, address: Address) -> Result<u32, TargetError> {
        self.target.read_memory32(address).await
    }

    pub(crate) async fn run(&mut self) -> Result<(), TargetError> {
        self.halted_at = None;
        self.target.run().await
    }

    pub(crate) async fn reset(&mut self) -> Result<(), TargetError> {
        self.halted_at = None;
        self.target.reset().await
    }

    pub async fn set_execution_address(&mut self, address: Address) -> Result<(), TargetError> {
        self.halted_at = None;
        self.target.set_execution_address(address).await?;
        self.halted_at = Some(address);
        Ok(())
    }

    /// Arm a temporary hardware breakpoint at `location`.
    pub async fn arm(&mut self, location: &Location) -> Result<(), TargetError> {
        self.target.set_breakpoint(location, true).await?;
        self.breakpoints.push(location.clone());
        Ok(())
    }

    /// Record that the temporary breakpoint at `location` was hit and is gone.
    pub(crate) fn hit(&mut self, location: &Location) {
        if let Some(index) = self.breakpoints.iter().position(|armed| armed == location) {
            self.breakpoints.remove(index);
        }
        self.halted_at = match location {
            Location::Address(address) => Some(*address),
            Location::Symbol(_) => None,
        };
    }

    pub async fn clear_breakpoints(&mut self) -> Result<(), TargetError> {
        self.target.remove_all_breakpoints().await?;
        self.breakpoints.clear();
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.target
    }
}
