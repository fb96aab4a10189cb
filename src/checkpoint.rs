//! Checkpoint persistence and rotation.
//!
//! A checkpoint is a single file holding the epoch, a snapshot of the
//! resolved run config, and the opaque state blobs of the model, optimizer,
//! and scheduler. Files are named `checkpoint_NN.bin` and the driver keeps
//! only the newest one, so a run directory never accumulates stale epochs.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

const MAGIC: &[u8; 4] = b"vlck";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a checkpoint file")]
    BadMagic { path: PathBuf },

    #[error("unsupported checkpoint version {found} in {path}")]
    Version { path: PathBuf, found: u32 },

    #[error("checkpoint {path} is truncated")]
    Truncated { path: PathBuf },

    #[error("invalid {section} state: {reason}")]
    BadState {
        section: &'static str,
        reason: String,
    },
}

/// Everything needed to resume a run exactly where it stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    pub config_json: String,
    pub model: Vec<u8>,
    pub optimizer: Vec<u8>,
    pub scheduler: Vec<u8>,
}

pub fn file_name(epoch: usize) -> String {
    format!("checkpoint_{epoch:02}.bin")
}

/// Write `checkpoint` under `dir`, returning the path of the new file.
pub fn save(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
    let path = dir.join(file_name(checkpoint.epoch));
    let io_err = |source| CheckpointError::Io {
        path: path.clone(),
        source,
    };

    let file = fs::File::create(&path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC).map_err(io_err)?;
    writer.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
    writer
        .write_all(&(checkpoint.epoch as u64).to_le_bytes())
        .map_err(io_err)?;
    for section in [
        checkpoint.config_json.as_bytes(),
        &checkpoint.model,
        &checkpoint.optimizer,
        &checkpoint.scheduler,
    ] {
        writer
            .write_all(&(section.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        writer.write_all(section).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut cursor = 0usize;
    let magic = take(&bytes, &mut cursor, MAGIC.len(), path)?;
    if magic != MAGIC {
        return Err(CheckpointError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let version = u32::from_le_bytes(
        take(&bytes, &mut cursor, 4, path)?
            .try_into()
            .map_err(|_| truncated(path))?,
    );
    if version != VERSION {
        return Err(CheckpointError::Version {
            path: path.to_path_buf(),
            found: version,
        });
    }
    let epoch = read_u64(&bytes, &mut cursor, path)? as usize;
    let config_json = String::from_utf8(read_section(&bytes, &mut cursor, path)?).map_err(
        |err| CheckpointError::BadState {
            section: "config",
            reason: err.to_string(),
        },
    )?;
    let model = read_section(&bytes, &mut cursor, path)?;
    let optimizer = read_section(&bytes, &mut cursor, path)?;
    let scheduler = read_section(&bytes, &mut cursor, path)?;

    Ok(Checkpoint {
        epoch,
        config_json,
        model,
        optimizer,
        scheduler,
    })
}

/// Delete the checkpoints of all epochs before `epoch`.
///
/// Nothing is removed unless the file for `epoch` itself exists, so an
/// interrupted save never costs the previous snapshot.
pub fn remove_previous(dir: &Path, epoch: usize) -> Result<(), CheckpointError> {
    if !dir.join(file_name(epoch)).exists() {
        return Ok(());
    }
    for earlier in 0..epoch {
        let path = dir.join(file_name(earlier));
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed superseded checkpoint"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(CheckpointError::Io { path, source }),
        }
    }
    Ok(())
}

fn truncated(path: &Path) -> CheckpointError {
    CheckpointError::Truncated {
        path: path.to_path_buf(),
    }
}

fn take<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
    path: &Path,
) -> Result<&'a [u8], CheckpointError> {
    let end = cursor
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| truncated(path))?;
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_u64(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<u64, CheckpointError> {
    let raw = take(bytes, cursor, 8, path)?;
    Ok(u64::from_le_bytes(raw.try_into().map_err(|_| truncated(path))?))
}

fn read_section(
    bytes: &[u8],
    cursor: &mut usize,
    path: &Path,
) -> Result<Vec<u8>, CheckpointError> {
    let len = read_u64(bytes, cursor, path)? as usize;
    Ok(take(bytes, cursor, len, path)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(epoch: usize) -> Checkpoint {
        Checkpoint {
            epoch,
            config_json: r#"{"batch_size": 64}"#.to_string(),
            model: vec![1, 2, 3, 4],
            optimizer: vec![9; 100],
            scheduler: vec![],
        }
    }

    #[test]
    fn test_file_name_zero_padded() {
        assert_eq!(file_name(3), "checkpoint_03.bin");
        assert_eq!(file_name(27), "checkpoint_27.bin");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = sample(7);
        let path = save(dir.path(), &checkpoint).unwrap();
        assert_eq!(path, dir.path().join("checkpoint_07.bin"));
        assert_eq!(load(&path).unwrap(), checkpoint);
    }

    #[test]
    fn test_rotation_removes_earlier_epochs() {
        let dir = tempfile::tempdir().unwrap();
        for epoch in 0..3 {
            save(dir.path(), &sample(epoch)).unwrap();
        }
        remove_previous(dir.path(), 2).unwrap();
        assert!(!dir.path().join("checkpoint_00.bin").exists());
        assert!(!dir.path().join("checkpoint_01.bin").exists());
        assert!(dir.path().join("checkpoint_02.bin").exists());
    }

    #[test]
    fn test_rotation_keeps_all_without_current() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &sample(0)).unwrap();
        remove_previous(dir.path(), 2).unwrap();
        assert!(dir.path().join("checkpoint_00.bin").exists());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.bin");
        fs::write(&path, b"not a checkpoint at all").unwrap();
        assert!(matches!(
            load(&path),
            Err(CheckpointError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = save(dir.path(), &sample(0)).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            load(&path),
            Err(CheckpointError::Truncated { .. })
        ));
    }
}
