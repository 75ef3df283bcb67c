//! Target that writes an Arm Development Studio command script instead of driving a probe.
//!
//! The script is meant to be sourced by the debugger connected to the real target. Only what
//! follows from the commands themselves is known here: the program counter after setting it,
//! after stopping at an absolute breakpoint, or after stopping at a symbol that the stage's
//! symbol file defines. Everything else is [`TargetError::Unsupported`].
//!
//! Every wait is assumed to succeed. Reporting a breakpoint that is never hit is left to the
//! debugger running the script, and each `wait` is followed by a `stop` so the target ends up
//! halted either way. Only symbol files loaded by the script itself are discarded again.

use core::time::Duration;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use xmas_elf::{ElfFile, sections::SectionData, symbol_table::Entry};

use crate::{Address, Location, Target, TargetError, TargetState, target::PROGRAM_COUNTER};

pub struct ScriptTarget<W> {
    out: W,
    /// Directory receiving the images that `restore` commands refer to.
    staging: PathBuf,
    state: TargetState,
    pc: Option<Address>,
    pending: Option<Location>,
    /// Symbol the target stopped at while its address is still unknown.
    stopped_at: Option<String>,
    loaded: BTreeSet<PathBuf>,
}

impl<W: Write> ScriptTarget<W> {
    pub fn new(out: W, staging: impl Into<PathBuf>) -> Self {
        Self {
            out,
            staging: staging.into(),
            state: TargetState::Unknown,
            pc: None,
            pending: None,
            stopped_at: None,
            loaded: BTreeSet::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, command: &str) -> Result<(), TargetError> {
        debug!("> {command}");
        writeln!(self.out, "{command}").map_err(|e| TargetError::Unreachable(e.to_string()))
    }

    fn forget_position(&mut self) {
        self.pc = None;
        self.stopped_at = None;
    }
}

impl<W: Write> Target for ScriptTarget<W> {
    async fn stop(&mut self) -> Result<(), TargetError> {
        self.emit("stop")?;
        self.state = TargetState::Stopped;
        Ok(())
    }

    async fn run(&mut self) -> Result<(), TargetError> {
        self.emit("continue")?;
        self.state = TargetState::Running;
        self.forget_position();
        Ok(())
    }

    async fn wait_for_stop(&mut self, timeout: Duration) -> Result<bool, TargetError> {
        self.emit(&format!("wait {}s", timeout.as_secs().max(1)))?;
        self.emit("stop")?;
        self.state = TargetState::Stopped;
        match self.pending.take() {
            Some(Location::Address(address)) => self.pc = Some(address),
            Some(Location::Symbol(symbol)) => self.stopped_at = Some(symbol),
            None => {}
        }
        Ok(true)
    }

    async fn set_breakpoint(
        &mut self,
        location: &Location,
        temporary: bool,
    ) -> Result<(), TargetError> {
        if temporary {
            self.emit(&format!("thbreak {location}"))?;
            self.pending = Some(location.clone());
        } else {
            self.emit(&format!("hbreak {location}"))?;
        }
        Ok(())
    }

    async fn remove_all_breakpoints(&mut self) -> Result<(), TargetError> {
        self.pending = None;
        self.emit("delete")
    }

    async fn set_execution_address(&mut self, address: Address) -> Result<(), TargetError> {
        self.emit(&format!("set var $pc = {address}"))?;
        self.stopped_at = None;
        self.pc = Some(address);
        Ok(())
    }

    async fn read_register(&mut self, name: &str) -> Result<u64, TargetError> {
        match (name, self.pc) {
            (PROGRAM_COUNTER, Some(pc)) => Ok(pc.offset),
            _ => Err(TargetError::Unsupported("reading registers")),
        }
    }

    async fn read_memory32(&mut self, _address: Address) -> Result<u32, TargetError> {
        Err(TargetError::Unsupported("reading memory"))
    }

    async fn write_memory_block(
        &mut self,
        address: Address,
        bytes: &[u8],
    ) -> Result<(), TargetError> {
        let path = self.staging.join(format!("image_{:08x}.bin", address.offset));
        std::fs::write(&path, bytes)
            .map_err(|e| TargetError::Rejected(format!("{}: {e}", path.display())))?;
        self.emit(&format!("restore \"{}\" binary {address}", path.display()))
    }

    async fn load_symbols(&mut self, path: &Path) -> Result<(), TargetError> {
        self.emit(&format!("add-symbol-file \"{}\"", path.display()))?;
        self.loaded.insert(path.to_path_buf());

        if let (None, Some(symbol)) = (self.pc, &self.stopped_at) {
            match symbol_value(path, symbol) {
                Ok(Some(value)) => {
                    let address = Address::new(value);
                    debug!("{symbol} is {address} in {}", path.display());
                    self.pc = Some(address);
                }
                Ok(None) => debug!("{symbol} is not defined in {}", path.display()),
                Err(e) => warn!("cannot read symbols from {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    async fn unload_symbols(&mut self, path: &Path) -> Result<(), TargetError> {
        if !self.loaded.remove(path) {
            return Err(TargetError::NotLoaded(path.to_path_buf()));
        }
        self.emit(&format!("discard-symbol-file \"{}\"", path.display()))
    }

    async fn reset(&mut self) -> Result<(), TargetError> {
        self.emit("reset")?;
        self.state = TargetState::Stopped;
        self.pending = None;
        self.forget_position();
        Ok(())
    }

    async fn state(&mut self) -> Result<TargetState, TargetError> {
        Ok(self.state)
    }

    async fn idle(&mut self, _duration: Duration) {}

    async fn disassemble(&mut self, address: Address) -> Result<String, TargetError> {
        self.emit(&format!("x/i {address}"))?;
        Ok(String::from("(printed by the debugger)"))
    }
}

/// Value of `symbol` in the symbol table of the ELF file at `path`.
fn symbol_value(path: &Path, symbol: &str) -> Result<Option<u64>, String> {
    let data = std::fs::read(path).map_err(|e| e.to_string())?;
    let elf = ElfFile::new(&data)?;
    let Some(symtab) = elf.find_section_by_name(".symtab") else {
        return Ok(None);
    };

    Ok(match symtab.get_data(&elf)? {
        SectionData::SymbolTable32(entries) => find_symbol(&elf, entries, symbol),
        SectionData::SymbolTable64(entries) => find_symbol(&elf, entries, symbol),
        _ => None,
    })
}

fn find_symbol<E: Entry>(elf: &ElfFile<'_>, entries: &[E], symbol: &str) -> Option<u64> {
    entries
        .iter()
        .find(|entry| entry.get_name(elf) == Ok(symbol))
        .map(|entry| entry.value())
}
