//! Boot checkpoint collaborator.
//!
//! The init system owns the actual boot-confirmation machinery
//! (boot counting, retry limits); the daemon only asks three things of
//! it. A staged activation opens a checkpoint window; whether the next
//! boot was committed decides keep-or-revert.

use std::io;
use std::path::PathBuf;

pub trait CheckpointService: Send + Sync {
    /// Whether the current boot has been confirmed committed.
    fn is_boot_committed(&self) -> bool;

    /// Open a checkpoint window: the upcoming boot counts as
    /// unconfirmed until the init system commits it.
    fn start_checkpoint(&self) -> io::Result<()>;

    /// Cancel the current checkpoint window.
    fn abort_checkpoint(&self) -> io::Result<()>;
}

/// Marker files under the checkpoint directory, maintained together
/// with the init system: `committed` is written by init once a boot is
/// accepted, `active` marks an open checkpoint window.
pub struct FileCheckpoint {
    dir: PathBuf,
}

impl FileCheckpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn committed_marker(&self) -> PathBuf {
        self.dir.join("committed")
    }

    fn active_marker(&self) -> PathBuf {
        self.dir.join("active")
    }

    fn remove_marker(path: &PathBuf) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl CheckpointService for FileCheckpoint {
    fn is_boot_committed(&self) -> bool {
        self.committed_marker().exists()
    }

    fn start_checkpoint(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Self::remove_marker(&self.committed_marker())?;
        std::fs::write(self.active_marker(), b"")
    }

    fn abort_checkpoint(&self) -> io::Result<()> {
        Self::remove_marker(&self.active_marker())
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory checkpoint service for tests.

    use super::*;
    use std::sync::Mutex;

    pub struct FakeCheckpoint {
        committed: Mutex<bool>,
        started: Mutex<usize>,
        aborted: Mutex<usize>,
    }

    impl FakeCheckpoint {
        pub fn committed() -> Self {
            Self::with_committed(true)
        }

        pub fn uncommitted() -> Self {
            Self::with_committed(false)
        }

        fn with_committed(committed: bool) -> Self {
            Self {
                committed: Mutex::new(committed),
                started: Mutex::new(0),
                aborted: Mutex::new(0),
            }
        }

        pub fn starts(&self) -> usize {
            *self.started.lock().unwrap()
        }

        pub fn aborts(&self) -> usize {
            *self.aborted.lock().unwrap()
        }
    }

    impl CheckpointService for FakeCheckpoint {
        fn is_boot_committed(&self) -> bool {
            *self.committed.lock().unwrap()
        }

        fn start_checkpoint(&self) -> io::Result<()> {
            *self.started.lock().unwrap() += 1;
            *self.committed.lock().unwrap() = false;
            Ok(())
        }

        fn abort_checkpoint(&self) -> io::Result<()> {
            *self.aborted.lock().unwrap() += 1;
            Ok(())
        }
    }
}
