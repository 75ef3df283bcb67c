//! Keeps the debugger's loaded symbol files in step with what is about to run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::{Error, Target, TargetError, TargetSession};

/// Symbol files currently associated with the target's execution context.
#[derive(Debug, Default)]
pub struct SymbolStore {
    loaded: BTreeSet<PathBuf>,
}

impl SymbolStore {
    pub fn is_loaded(&self, path: &Path) -> bool {
        self.loaded.contains(path)
    }

    pub fn loaded(&self) -> impl Iterator<Item = &Path> {
        self.loaded.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

/// Replace whatever symbols the debugger holds for `path` with a fresh load.
///
/// The unload is always attempted, since the debugger may hold the file from an earlier
/// session. Its failure is logged and otherwise ignored, unless the target is gone.
/// A failed load leaves `path` unmarked.
pub async fn reload<T: Target>(session: &mut TargetSession<T>, path: &Path) -> Result<(), Error> {
    let tracked = session.symbols().is_loaded(path);

    match session.target_mut().unload_symbols(path).await {
        Ok(()) => debug!("unloaded symbols {}", path.display()),
        Err(TargetError::Unreachable(detail)) => return Err(Error::TargetUnreachable(detail)),
        Err(TargetError::NotLoaded(_)) if !tracked => {
            debug!("symbols {} were not loaded", path.display())
        }
        Err(e) => warn!("failed unloading {}: {e}", path.display()),
    }
    session.symbols_mut().loaded.remove(path);

    info!("loading symbols {}", path.display());
    match session.target_mut().load_symbols(path).await {
        Ok(()) => {
            session.symbols_mut().loaded.insert(path.to_path_buf());
            Ok(())
        }
        Err(TargetError::Unreachable(detail)) => Err(Error::TargetUnreachable(detail)),
        Err(source) => Err(Error::SymbolReloadFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}
