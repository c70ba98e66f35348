//! Session persistence layer for atomic file-based storage.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;
use tracing::{debug, info, warn};

use super::{Session, SESSION_STATE_VERSION};
use crate::error::{IntoMenderError, MenderError, Result};

/// Default session file name.
const SESSION_FILE: &str = "session.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Suffix for unreadable session files moved out of the way.
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Directory for finished sessions.
const ARCHIVE_DIR: &str = "archive";

/// Durable storage for the active session.
pub trait SessionStore: Send + Sync {
    /// Load the active session, if any. The result always has `running = false`.
    fn load(&self) -> Result<Option<Session>>;

    /// Persist `session` as the active session.
    fn save(&self, session: &Session) -> Result<()>;

    /// Move `session` out of the active slot into long-term storage.
    fn archive(&self, session: &Session) -> Result<()>;
}

/// Session store backed by a JSON file under the state directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    /// Directory where session files are stored.
    dir: PathBuf,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn session_file_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        self.dir.join(format!("{SESSION_FILE}{TMP_SUFFIX}"))
    }

    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        self.dir.join(format!("{SESSION_FILE}{LOCK_SUFFIX}"))
    }

    #[must_use]
    pub fn corrupt_file_path(&self) -> PathBuf {
        self.dir.join(format!("{SESSION_FILE}{CORRUPT_SUFFIX}"))
    }

    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join(ARCHIVE_DIR)
    }

    #[must_use]
    pub fn archive_path(&self, session_id: &str) -> PathBuf {
        self.archive_dir().join(format!("session-{session_id}.json"))
    }

    /// Checks if an active session file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.session_file_path().exists()
    }

    /// The most recently archived session, if any.
    pub fn latest_archived(&self) -> Result<Option<Session>> {
        let dir = self.archive_dir();
        if !dir.exists() {
            return Ok(None);
        }

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().is_none_or(|(at, _)| modified > *at) {
                newest = Some((modified, path));
            }
        }

        match newest {
            Some((_, path)) => {
                let contents = fs::read_to_string(&path)?;
                Ok(Some(serde_json::from_str(&contents)?))
            }
            None => Ok(None),
        }
    }

    /// Read the active session exactly as persisted, `running` flag included.
    ///
    /// Unlike [`SessionStore::load`] this never quarantines the file, so it is
    /// safe to call while a controller owns the session.
    pub fn peek(&self) -> Result<Option<Session>> {
        match fs::read_to_string(self.session_file_path()) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)
            .context("Failed to acquire session lock")
            .into_mender_persistence()?;
        Ok(lock_file)
    }

    fn write_atomic(&self, target: &Path, session: &Session) -> Result<()> {
        let tmp_path = target.with_extension(format!("json{TMP_SUFFIX}"));
        let json = serde_json::to_string_pretty(session)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, target)?;
        Ok(())
    }

    /// Parse a session file, rejecting unreadable or incompatible contents.
    fn parse(&self, path: &Path, contents: &str) -> Result<Session> {
        let session: Session = serde_json::from_str(contents)
            .map_err(|e| MenderError::corrupt_state(path.to_path_buf(), e.to_string()))?;

        if !session.is_version_compatible() {
            return Err(MenderError::corrupt_state(
                path.to_path_buf(),
                format!(
                    "incompatible session version {} (supported: {})",
                    session.metadata.version, SESSION_STATE_VERSION
                ),
            ));
        }
        Ok(session)
    }

    fn quarantine(&self, path: &Path, err: &MenderError) {
        warn!("{}. Moving it aside and starting fresh.", err);
        if let Err(e) = fs::rename(path, self.corrupt_file_path()) {
            warn!("Failed to move unusable session file aside: {}", e);
            let _ = fs::remove_file(path);
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Session>> {
        let session_path = self.session_file_path();
        if !session_path.exists() {
            return Ok(None);
        }

        let _lock = self.lock()?;

        let mut file = match File::open(&session_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        drop(file);

        let mut session = match self.parse(&session_path, &contents) {
            Ok(session) => session,
            Err(e @ MenderError::CorruptState { .. }) => {
                self.quarantine(&session_path, &e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        session.running = false;
        debug!(session_id = %session.id, cycle = session.cycle, "Session loaded");
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let _lock = self.lock()?;
        self.write_atomic(&self.session_file_path(), session)
    }

    fn archive(&self, session: &Session) -> Result<()> {
        let _lock = self.lock()?;
        fs::create_dir_all(self.archive_dir())?;

        let target = self.archive_path(&session.id);
        self.write_atomic(&target, session)?;

        // Only clear the active slot if it still holds this session.
        let session_path = self.session_file_path();
        if let Ok(contents) = fs::read_to_string(&session_path) {
            let active_id = serde_json::from_str::<Session>(&contents)
                .map(|s| s.id)
                .ok();
            if active_id.as_deref().is_none_or(|id| id == session.id) {
                fs::remove_file(&session_path)?;
            }
        }

        info!(session_id = %session.id, path = %target.display(), "Session archived");
        Ok(())
    }
}
