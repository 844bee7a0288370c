//! PID-file locking, modeled on `common::fs::DirLock`'s use of
//! `fs2::FileExt::try_lock_exclusive`, adapted to a single file holding the
//! ASCII decimal PID rather than locking an entire directory.

use std::io::Write;
use std::os::unix::prelude::{FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};

use common::async_std::fs::OpenOptions;
use common::errors::*;
use fs2::FileExt;

use crate::exitcode::ExitCode;

pub struct PidFile {
    _file: std::fs::File,
    path: PathBuf,
}

impl PidFile {
    /// Attempts to acquire the PID file at `lock_dir/<name>.pid`. On
    /// failure to lock (another live instance holds it) this returns
    /// `ExitCode::PidLock` as an error payload for the caller to exit with.
    pub async fn acquire(lock_dir: &Path, name: &str) -> Result<PidFile> {
        if !common::async_std::path::Path::new(lock_dir).exists().await {
            common::async_std::fs::create_dir_all(lock_dir).await?;
        }

        let path = lock_dir.join(format!("{}.pid", name));

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).read(true);

        let file = opts
            .open(&path)
            .await
            .map_err(|e| format_err!("failed to open pid file {:?}: {}", path, e))?;

        let file = unsafe { std::fs::File::from_raw_fd(file.into_raw_fd()) };

        if file.try_lock_exclusive().is_err() {
            return Err(PidFileError::AlreadyLocked.into());
        }

        let mut file = file;
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(PidFile { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Fail)]
pub enum PidFileError {
    #[fail(display = "pid file is already locked by another process")]
    AlreadyLocked,
}

impl PidFileError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            PidFileError::AlreadyLocked => ExitCode::PidLock,
        }
    }
}

use common::failure::Fail;
