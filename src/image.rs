//! Byte-exact transfer of raw binary images into target memory.

use std::path::Path;

use log::{info, warn};

use crate::{
    Address, EntryLocator, Error, Stage, Target, TargetError, TargetSession,
    target::PROGRAM_COUNTER,
};

/// Result of a successful image load.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoadedImage {
    pub address: Address,
    pub len: usize,
    /// Disassembly of the first instruction, if the target could provide it.
    pub first_instruction: Option<String>,
}

/// Write the file at `path` into target memory at `address` in a single block.
///
/// An empty file is refused before the target is touched.
pub async fn load_binary<T: Target>(
    session: &mut TargetSession<T>,
    path: &Path,
    address: Address,
) -> Result<LoadedImage, Error> {
    let bytes = std::fs::read(path).map_err(|source| Error::ArtifactNotFound {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(Error::EmptyImage(path.to_path_buf()));
    }

    info!(
        "loading {} ({} bytes) @ {address}",
        path.display(),
        bytes.len()
    );
    session
        .target_mut()
        .write_memory_block(address, &bytes)
        .await
        .map_err(|source| match source {
            TargetError::Unreachable(detail) => Error::TargetUnreachable(detail),
            source => Error::ImageWriteFailed {
                path: path.to_path_buf(),
                address,
                source,
            },
        })?;

    let first_instruction = match session.target_mut().disassemble(address).await {
        Ok(text) => {
            info!("{address}\t{text}");
            Some(text)
        }
        Err(e) => {
            warn!("cannot disassemble {address}: {e}");
            None
        }
    };

    Ok(LoadedImage {
        address,
        len: bytes.len(),
        first_instruction,
    })
}

/// Address a stage's image is written to.
///
/// An explicit load address always wins. Otherwise the image goes where the target is
/// stopped, in the address space of the stage's entry.
pub async fn load_address<T: Target>(
    session: &mut TargetSession<T>,
    stage: &Stage,
) -> Result<Address, Error> {
    if let Some(address) = stage.load_address {
        return Ok(address);
    }

    let pc = program_counter(session).await?;
    Ok(match &stage.entry {
        EntryLocator::Absolute(entry) => entry.with_offset(pc),
        _ => Address::new(pc),
    })
}

pub(crate) async fn program_counter<T: Target>(
    session: &mut TargetSession<T>,
) -> Result<u64, Error> {
    session
        .target_mut()
        .read_register(PROGRAM_COUNTER)
        .await
        .map_err(|source| match source {
            TargetError::Unreachable(detail) => Error::TargetUnreachable(detail),
            source => Error::ProgramCounterUnavailable(source),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Artifacts, SimulatedTarget};

    #[test]
    fn writes_exact_bytes() {
        let artifacts = Artifacts::new();
        let path = artifacts.file("bl2.bin", &[0xde, 0xad, 0xbe, 0xef, 0x01]);
        let mut session = TargetSession::new(SimulatedTarget::new());
        let address = Address::secure(0x10_0000);

        let loaded =
            embassy_futures::block_on(async { load_binary(&mut session, &path, address).await })
                .unwrap();

        assert_eq!(loaded.address, address);
        assert_eq!(loaded.len, 5);
        assert_eq!(loaded.first_instruction.as_deref(), Some(".word 0xefbeadde"));
        assert_eq!(
            session.target().bytes(0x10_0000, 6),
            [0xde, 0xad, 0xbe, 0xef, 0x01, 0x00]
        );
        assert_eq!(session.target().calls.writes, 1);
    }

    #[test]
    fn empty_image_is_refused() {
        let artifacts = Artifacts::new();
        let path = artifacts.file("bl2.bin", &[]);
        let mut session = TargetSession::new(SimulatedTarget::new());

        let result = embassy_futures::block_on(async {
            load_binary(&mut session, &path, Address::new(0)).await
        });

        assert!(matches!(result, Err(Error::EmptyImage(_))));
        assert_eq!(session.target().calls.writes, 0);
    }

    #[test]
    fn missing_image() {
        let artifacts = Artifacts::new();
        let mut session = TargetSession::new(SimulatedTarget::new());

        let result = embassy_futures::block_on(async {
            load_binary(&mut session, &artifacts.path("bl2.bin"), Address::new(0)).await
        });

        assert!(matches!(result, Err(Error::ArtifactNotFound { .. })));
        assert_eq!(session.target().calls.writes, 0);
    }

    #[test]
    fn rejected_write() {
        let artifacts = Artifacts::new();
        let path = artifacts.file("bl2.bin", &[1, 2, 3, 4]);
        let mut target = SimulatedTarget::new();
        target.faults.write_memory = true;
        let mut session = TargetSession::new(target);

        let result = embassy_futures::block_on(async {
            load_binary(&mut session, &path, Address::new(0x10_0000)).await
        });

        assert!(matches!(
            result,
            Err(Error::ImageWriteFailed { address, .. }) if address == Address::new(0x10_0000)
        ));
    }

    #[test]
    fn load_address_defaults_to_pc() {
        let mut target = SimulatedTarget::new();
        target.pc = 0x6000_0000;
        let mut session = TargetSession::new(target);

        let stage = Stage::new(
            "bl32",
            EntryLocator::Absolute(Address::secure(0x6000_0000)),
            "bl32.elf",
            "bl32.bin",
        );
        let explicit = stage.clone().with_load_address(Address::secure(0x6000_1000));

        embassy_futures::block_on(async {
            assert_eq!(
                load_address(&mut session, &stage).await.unwrap(),
                Address::secure(0x6000_0000)
            );
            assert_eq!(
                load_address(&mut session, &explicit).await.unwrap(),
                Address::secure(0x6000_1000)
            );
        });
    }
}
