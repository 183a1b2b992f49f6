//! Replay point
//!
//! A tiny file in the log directory recording the file_id from which a
//! restart should begin local replay.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{LogError, Result};

const REPLAY_POINT_FILENAME: &str = "replay_point";
const REPLAY_POINT_TMP: &str = "replay_point.tmp";

/// file_id (8) + crc32 (4)
const REPLAY_POINT_SIZE: usize = 12;

/// Persisted replay start
pub struct ReplayPointFile {
    dir: PathBuf,
}

impl ReplayPointFile {
    pub fn open(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(REPLAY_POINT_FILENAME)
    }

    /// Record `file_id` as the replay start
    ///
    /// Written to a temp file, synced, then renamed over the old point.
    pub fn write(&self, file_id: u64) -> Result<()> {
        if file_id == 0 {
            return Err(LogError::InvalidArgument("replay point file_id 0".to_string()));
        }

        let mut buf = Vec::with_capacity(REPLAY_POINT_SIZE);
        buf.extend_from_slice(&file_id.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&file_id.to_le_bytes()).to_le_bytes());

        let temp_path = self.dir.join(REPLAY_POINT_TMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.path())?;

        debug!(file_id, "replay point written");
        Ok(())
    }

    /// Read the recorded file_id, `None` if absent or unreadable
    pub fn read(&self) -> Result<Option<u64>> {
        let mut file = match File::open(self.path()) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut buf = Vec::with_capacity(REPLAY_POINT_SIZE);
        file.read_to_end(&mut buf)?;
        if buf.len() != REPLAY_POINT_SIZE {
            warn!(len = buf.len(), "ignoring truncated replay point");
            return Ok(None);
        }

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&buf[8..]);
        if crc32fast::hash(&raw) != u32::from_le_bytes(crc) {
            warn!("ignoring replay point with bad checksum");
            return Ok(None);
        }

        let file_id = u64::from_le_bytes(raw);
        Ok(if file_id == 0 { None } else { Some(file_id) })
    }
}
