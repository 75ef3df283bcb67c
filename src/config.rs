//! Board tables, build roots and image variants.
//!
//! A board table lists a board's stages and the sequences they are booted in:
//!
//! ```toml
//! name = "lan966x"
//! build_target = "lan966x_sr"
//! variant_register = "S:0xe00c0080"
//!
//! [[stage]]
//! name = "bl2"
//! entry = "S:0x00100000"
//! symbols = "{build}/bl2/bl2.elf"
//! image = "{build}/bl2.bin"
//!
//! [sequences]
//! reset = ["bl1", "bl2"]
//! ```
//!
//! `{build}` in paths is replaced with the [`BuildRoot`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::{Address, EntryLocator, Stage, Target, TargetSession};

/// Built-in table for LAN966x boards.
pub const LAN966X: &str = include_str!("../boards/lan966x.toml");

/// File in the home directory naming the build root to use.
pub const HINT_FILE: &str = ".atfpath";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read board table {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid board table")]
    Parse(#[from] toml::de::Error),
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
    #[error("unknown sequence `{0}`")]
    UnknownSequence(String),
    #[error("stage `{0}` is listed twice")]
    DuplicateStage(String),
    #[error("stage `{0}` enters at `pc`, which cannot be told apart from a stale stop")]
    AmbiguousEntry(String),
}

/// Which build of the images the target needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Variant {
    /// Evaluation board.
    #[default]
    Board,
    Fpga,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageEntry {
    pub name: String,
    pub entry: EntryLocator,
    pub symbols: String,
    pub image: String,
    /// Image used instead of `image` on FPGA targets.
    #[serde(default)]
    pub fpga_image: Option<String>,
    #[serde(default)]
    pub load_address: Option<Address>,
}

impl StageEntry {
    pub fn resolve(&self, root: &BuildRoot, variant: Variant) -> Stage {
        let image = match (variant, &self.fpga_image) {
            (Variant::Fpga, Some(fpga_image)) => fpga_image,
            (Variant::Fpga, None) => {
                debug!("{}: no FPGA image, using {}", self.name, self.image);
                &self.image
            }
            (Variant::Board, _) => &self.image,
        };

        let stage = Stage::new(
            &self.name,
            self.entry.clone(),
            root.expand(&self.symbols),
            root.expand(image),
        );
        match self.load_address {
            Some(address) => stage.with_load_address(address),
            None => stage,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardTable {
    pub name: String,
    /// Build target name, used for the default build root.
    pub build_target: String,
    /// Word that reads nonzero on FPGA targets.
    #[serde(default)]
    pub variant_register: Option<Address>,
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageEntry>,
    #[serde(default)]
    pub sequences: BTreeMap<String, Vec<String>>,
}

impl BoardTable {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let table: BoardTable = toml::from_str(text)?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn lan966x() -> Result<Self, ConfigError> {
        Self::from_toml(LAN966X)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            if stage.entry == EntryLocator::CurrentPc {
                return Err(ConfigError::AmbiguousEntry(stage.name.clone()));
            }
        }

        for name in self.sequences.values().flatten() {
            if !names.contains(name.as_str()) {
                return Err(ConfigError::UnknownStage(name.clone()));
            }
        }
        Ok(())
    }

    pub fn stage(
        &self,
        name: &str,
        root: &BuildRoot,
        variant: Variant,
    ) -> Result<Stage, ConfigError> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| stage.resolve(root, variant))
            .ok_or_else(|| ConfigError::UnknownStage(name.to_owned()))
    }

    /// Stages of sequence `name`, in boot order.
    pub fn sequence(
        &self,
        name: &str,
        root: &BuildRoot,
        variant: Variant,
    ) -> Result<Vec<Stage>, ConfigError> {
        self.sequences
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSequence(name.to_owned()))?
            .iter()
            .map(|stage| self.stage(stage, root, variant))
            .collect()
    }
}

/// Directory the firmware build writes its artifacts to.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BuildRoot(PathBuf);

impl BuildRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Build root named by `~/.atfpath`, or `build/<build_target>/debug`.
    pub fn resolve(build_target: &str) -> Self {
        let hint = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(HINT_FILE));
        Self::resolve_with(build_target, hint.as_deref())
    }

    /// Like [`BuildRoot::resolve`], with an explicit hint file.
    ///
    /// The first line of the hint file wins if it can be read and is not blank.
    pub fn resolve_with(build_target: &str, hint: Option<&Path>) -> Self {
        if let Some(hint) = hint {
            match std::fs::read_to_string(hint) {
                Ok(text) => {
                    let line = text.lines().next().unwrap_or_default().trim();
                    if !line.is_empty() {
                        debug!("build root {line} from {}", hint.display());
                        return Self::new(line);
                    }
                }
                Err(e) => debug!("no build root hint in {}: {e}", hint.display()),
            }
        }

        Self(Path::new("build").join(build_target).join("debug"))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn expand(&self, template: &str) -> PathBuf {
        PathBuf::from(template.replace("{build}", &self.0.to_string_lossy()))
    }
}

/// Read the variant register once to tell FPGA targets from evaluation boards.
pub async fn probe_variant<T: Target>(
    session: &mut TargetSession<T>,
    register: Address,
) -> Result<Variant, crate::Error> {
    session.stop().await?;
    let word = session.read_memory32(register).await?;
    let variant = if word != 0 {
        Variant::Fpga
    } else {
        Variant::Board
    };
    info!("variant register {register} = 0x{word:08x}: {variant:?}");
    Ok(variant)
}
