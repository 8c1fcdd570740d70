use std::fs::File;
use std::fs::OpenOptions;
use std::fs::TryLockError;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use crate::LimitError;

/// Exclusive advisory lock on a file, released on drop.
///
/// The OS drops the lock if the holding process dies, so a crashed holder
/// cannot wedge other processes. A live process that hangs while holding it
/// can, which is what `CrossProcessCoordinator::health_check` looks for.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to lock `path`, polling every `poll` for at most `timeout`.
    ///
    /// Returns `Ok(None)` if the lock is still held elsewhere when time runs out.
    pub(crate) fn acquire(
        path: &Path,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Self>, LimitError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LimitError::io(path, e))?;

        let start = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => {
                    return Ok(Some(Self {
                        file,
                        path: path.to_path_buf(),
                    }));
                }
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => return Err(LimitError::io(path, e)),
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                debug!(path = %path.display(), ?timeout, "lock still held; giving up");
                return Ok(None);
            }
            thread::sleep(poll.min(remaining));
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            // Closing the descriptor releases it anyway.
            debug!(path = %self.path.display(), error = %e, "explicit unlock failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;

    use super::*;

    const POLL: Duration = Duration::from_millis(5);

    #[test]
    fn it_excludes_a_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");

        let held = FileLock::acquire(&path, Duration::ZERO, POLL).unwrap();
        assert!(held.is_some());

        let start = Instant::now();
        let second = FileLock::acquire(&path, Duration::from_millis(50), POLL).unwrap();
        assert!(second.is_none());
        assert_ge!(start.elapsed(), Duration::from_millis(50));

        drop(held);
        assert!(FileLock::acquire(&path, Duration::ZERO, POLL).unwrap().is_some());
    }

    #[test]
    fn it_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");
        let held = FileLock::acquire(&path, Duration::ZERO, POLL)
            .unwrap()
            .unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let lock = FileLock::acquire(&path, Duration::from_secs(2), POLL).unwrap();
        assert!(lock.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn it_reports_unopenable_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("state.lock");
        assert!(matches!(
            FileLock::acquire(&path, Duration::ZERO, POLL),
            Err(LimitError::Io { .. })
        ));
    }
}
