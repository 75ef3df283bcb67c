use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{Address, EntryLocator, Location, Stage, Target, TargetError, TargetState};

/// Failures to inject into the simulated target.
#[derive(Debug, Default)]
pub struct Faults {
    pub read_pc: bool,
    pub load_symbols: bool,
    pub write_memory: bool,
    pub wait_for_stop: bool,
    pub unreachable: bool,
}

#[derive(Debug, Default)]
pub struct Calls {
    pub stops: usize,
    pub runs: usize,
    pub writes: usize,
    pub resets: usize,
    pub state_polls: usize,
    pub idle: Duration,
}

/// Target executing a scripted trace of program counters.
///
/// While running, every step of `trace` is one instruction. The target stops as soon as the
/// program counter matches an armed breakpoint, and times out once the trace runs dry.
pub struct SimulatedTarget {
    pub pc: u64,
    pub state: TargetState,
    pub memory: BTreeMap<u64, u8>,
    pub trace: VecDeque<u64>,
    pub symbol_addresses: BTreeMap<String, u64>,
    pub breakpoints: Vec<(Location, bool)>,
    pub symbols: Vec<PathBuf>,
    /// States reported by successive polls, after which `state` is reported.
    pub polls: VecDeque<TargetState>,
    pub faults: Faults,
    pub calls: Calls,
}

impl SimulatedTarget {
    pub fn new() -> Self {
        SimulatedTarget {
            pc: 0,
            state: TargetState::Stopped,
            memory: BTreeMap::new(),
            trace: VecDeque::new(),
            symbol_addresses: BTreeMap::new(),
            breakpoints: Vec::new(),
            symbols: Vec::new(),
            polls: VecDeque::new(),
            faults: Faults::default(),
            calls: Calls::default(),
        }
    }

    /// Extend the trace with `instructions` steps, the last of which lands on `entry`.
    pub fn walk_to(&mut self, entry: u64, instructions: usize) {
        let mut pc = self.trace.back().copied().unwrap_or(self.pc);
        for _ in 1..instructions {
            pc += 4;
            self.trace.push_back(pc);
        }
        self.trace.push_back(entry);
    }

    pub fn bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        (offset..offset + len as u64)
            .map(|addr| self.memory.get(&addr).copied().unwrap_or(0))
            .collect()
    }

    fn resolve(&self, location: &Location) -> Option<u64> {
        match location {
            Location::Address(address) => Some(address.offset),
            Location::Symbol(symbol) => self.symbol_addresses.get(symbol).copied(),
        }
    }

    fn connected(&self) -> Result<(), TargetError> {
        if self.faults.unreachable {
            Err(TargetError::Unreachable("probe disconnected".into()))
        } else {
            Ok(())
        }
    }

    fn halted(&self) -> Result<(), TargetError> {
        match self.state {
            TargetState::Stopped => Ok(()),
            _ => Err(TargetError::Rejected("target not halted".into())),
        }
    }
}

impl Target for SimulatedTarget {
    async fn stop(&mut self) -> Result<(), TargetError> {
        self.connected()?;
        self.calls.stops += 1;
        self.state = TargetState::Stopped;
        Ok(())
    }

    async fn run(&mut self) -> Result<(), TargetError> {
        self.connected()?;
        self.calls.runs += 1;
        self.state = TargetState::Running;
        Ok(())
    }

    async fn wait_for_stop(&mut self, timeout: Duration) -> Result<bool, TargetError> {
        self.connected()?;
        if self.faults.wait_for_stop {
            return Err(TargetError::Rejected("stop notification lost".into()));
        }
        if self.state != TargetState::Running {
            return Ok(true);
        }

        while let Some(pc) = self.trace.pop_front() {
            self.pc = pc;
            let hit = self
                .breakpoints
                .iter()
                .position(|(location, _)| self.resolve(location) == Some(pc));
            if let Some(index) = hit {
                if self.breakpoints[index].1 {
                    self.breakpoints.remove(index);
                }
                self.state = TargetState::Stopped;
                return Ok(true);
            }
        }

        std::thread::sleep(timeout);
        Ok(false)
    }

    async fn set_breakpoint(
        &mut self,
        location: &Location,
        temporary: bool,
    ) -> Result<(), TargetError> {
        self.connected()?;
        if self.resolve(location).is_none() {
            return Err(TargetError::Rejected(format!("unknown location {location}")));
        }
        self.breakpoints.push((location.clone(), temporary));
        Ok(())
    }

    async fn remove_all_breakpoints(&mut self) -> Result<(), TargetError> {
        self.connected()?;
        self.breakpoints.clear();
        Ok(())
    }

    async fn set_execution_address(&mut self, address: Address) -> Result<(), TargetError> {
        self.connected()?;
        self.halted()?;
        self.pc = address.offset;
        Ok(())
    }

    async fn read_register(&mut self, name: &str) -> Result<u64, TargetError> {
        self.connected()?;
        match name {
            "PC" if !self.faults.read_pc => Ok(self.pc),
            _ => Err(TargetError::Rejected(format!("cannot read {name}"))),
        }
    }

    async fn read_memory32(&mut self, address: Address) -> Result<u32, TargetError> {
        self.connected()?;
        let bytes = self.bytes(address.offset, 4);
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn write_memory_block(
        &mut self,
        address: Address,
        bytes: &[u8],
    ) -> Result<(), TargetError> {
        self.connected()?;
        if self.faults.write_memory {
            return Err(TargetError::Rejected("address not writable".into()));
        }
        self.halted()?;
        self.calls.writes += 1;
        for (addr, byte) in (address.offset..).zip(bytes) {
            self.memory.insert(addr, *byte);
        }
        Ok(())
    }

    async fn load_symbols(&mut self, path: &Path) -> Result<(), TargetError> {
        self.connected()?;
        if self.faults.load_symbols {
            return Err(TargetError::Rejected("not an ELF file".into()));
        }
        if self.symbols.iter().any(|loaded| loaded == path) {
            return Err(TargetError::Rejected(format!(
                "{} already loaded",
                path.display()
            )));
        }
        self.symbols.push(path.to_path_buf());
        Ok(())
    }

    async fn unload_symbols(&mut self, path: &Path) -> Result<(), TargetError> {
        self.connected()?;
        match self.symbols.iter().position(|loaded| loaded == path) {
            Some(index) => {
                self.symbols.remove(index);
                Ok(())
            }
            None => Err(TargetError::NotLoaded(path.to_path_buf())),
        }
    }

    async fn reset(&mut self) -> Result<(), TargetError> {
        self.connected()?;
        self.calls.resets += 1;
        self.pc = 0;
        self.state = TargetState::Unknown;
        Ok(())
    }

    async fn state(&mut self) -> Result<TargetState, TargetError> {
        self.connected()?;
        self.calls.state_polls += 1;
        if let Some(state) = self.polls.pop_front() {
            self.state = state;
        }
        Ok(self.state)
    }

    async fn idle(&mut self, duration: Duration) {
        self.calls.idle += duration;
    }
}

/// Scratch directory holding stage artifacts.
pub struct Artifacts {
    dir: TempDir,
}

impl Artifacts {
    pub fn new() -> Self {
        Artifacts {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Stage `name` with its symbols and an image containing `image`.
    pub fn stage(&self, name: &str, entry: EntryLocator, image: &[u8]) -> Stage {
        let symbols = self.file(&format!("{name}.elf"), b"\x7fELF");
        let image = self.file(&format!("{name}.bin"), image);
        Stage::new(name, entry, symbols, image)
    }
}

/// Little-endian ELF32 file whose only content is a symbol table defining `symbols`.
pub fn elf32(symbols: &[(&str, u32)]) -> Vec<u8> {
    const HEADER: usize = 52;
    const SECTION: usize = 40;
    const SHN_ABS: u16 = 0xfff1;

    let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0";
    let mut strtab = vec![0u8];
    let mut symtab = vec![0u8; 16];
    for (name, value) in symbols {
        symtab.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
        symtab.extend_from_slice(&value.to_le_bytes());
        symtab.extend_from_slice(&0u32.to_le_bytes());
        // Global function.
        symtab.extend_from_slice(&[0x12, 0]);
        symtab.extend_from_slice(&SHN_ABS.to_le_bytes());
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let symtab_at = HEADER;
    let strtab_at = symtab_at + symtab.len();
    let shstrtab_at = strtab_at + strtab.len();
    let sections_at = (shstrtab_at + shstrtab.len() + 3) & !3;
    let sections: [[usize; 10]; 4] = [
        [0; 10],
        [1, 2, 0, 0, symtab_at, symtab.len(), 2, 1, 4, 16],
        [9, 3, 0, 0, strtab_at, strtab.len(), 0, 0, 1, 0],
        [17, 3, 0, 0, shstrtab_at, shstrtab.len(), 0, 0, 1, 0],
    ];

    let mut elf = vec![0x7f, b'E', b'L', b'F', 1, 1, 1];
    elf.resize(16, 0);
    // Executable for ARM, version 1.
    elf.extend_from_slice(&2u16.to_le_bytes());
    elf.extend_from_slice(&40u16.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes());
    for word in [0, 0, sections_at as u32, 0] {
        elf.extend_from_slice(&word.to_le_bytes());
    }
    for half in [HEADER as u16, 32, 0, SECTION as u16, sections.len() as u16, 3] {
        elf.extend_from_slice(&half.to_le_bytes());
    }
    assert_eq!(elf.len(), HEADER);

    elf.extend_from_slice(&symtab);
    elf.extend_from_slice(&strtab);
    elf.extend_from_slice(shstrtab);
    elf.resize(sections_at, 0);
    for section in sections {
        for field in section {
            elf.extend_from_slice(&(field as u32).to_le_bytes());
        }
    }
    elf
}
