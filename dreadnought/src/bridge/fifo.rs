//! Named-pipe rendezvous for overflow workers.
//!
//! An overflow worker is not a child of the coordinator, so it cannot inherit
//! anonymous pipe ends. Instead the coordinator creates three FIFOs and both
//! sides open them in the same order: request, response, relay. Each blocking
//! open returns once the peer has opened the complementary end.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use super::protocol::OverflowRequest;

/// Three FIFO paths for one overflow transaction. Unlinked on drop.
#[derive(Debug)]
pub struct RendezvousPaths {
    pub request: PathBuf,
    pub response: PathBuf,
    pub relay: PathBuf,
}

impl RendezvousPaths {
    /// Create the FIFOs under `dir` with uuid-derived names.
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stem = uuid::Uuid::new_v4().simple().to_string();
        let paths = Self {
            request: dir.join(format!("{stem}.req")),
            response: dir.join(format!("{stem}.res")),
            relay: dir.join(format!("{stem}.log")),
        };
        // On failure `paths` drops and removes whichever FIFOs were made.
        for path in paths.iter() {
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)?;
        }
        Ok(paths)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        [
            self.request.as_path(),
            self.response.as_path(),
            self.relay.as_path(),
        ]
        .into_iter()
    }

    pub fn spawn_request(&self) -> OverflowRequest {
        OverflowRequest::Spawn {
            request_fifo: self.request.clone(),
            response_fifo: self.response.clone(),
            relay_fifo: self.relay.clone(),
        }
    }

    /// Coordinator side: request (write), response (read), relay (read).
    ///
    /// Blocks until the worker opens its ends.
    pub fn open_coordinator_ends(&self) -> io::Result<CoordinatorEnds> {
        let request = open_fifo(&self.request, FifoEnd::Write)?;
        let response = open_fifo(&self.response, FifoEnd::Read)?;
        let relay = open_fifo(&self.relay, FifoEnd::Read)?;
        Ok(CoordinatorEnds {
            request,
            response,
            relay,
        })
    }

    /// Release opens blocked on these FIFOs, on either side.
    ///
    /// Every open of a FIFO succeeds while one of the returned handles holds
    /// it, so keep them until the blocked opener has returned.
    pub fn unblock(&self) -> Vec<File> {
        self.iter()
            .filter_map(|path| match unblock_fifo(path) {
                Ok(file) => Some(file),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "FIFO unblock failed");
                    None
                }
            })
            .collect()
    }
}

impl Drop for RendezvousPaths {
    fn drop(&mut self) {
        for path in self.iter() {
            if let Err(e) = fs::remove_file(path)
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove FIFO");
            }
        }
    }
}

/// Worker-side ends in the order they must be opened.
pub struct WorkerEnds {
    pub request: OwnedFd,
    pub response: OwnedFd,
    pub relay: OwnedFd,
}

/// Coordinator-side ends in the order they must be opened.
pub struct CoordinatorEnds {
    pub request: OwnedFd,
    pub response: OwnedFd,
    pub relay: OwnedFd,
}

/// Worker side: request (read), response (write), relay (write).
pub fn open_worker_ends(request: &Path, response: &Path, relay: &Path) -> io::Result<WorkerEnds> {
    let request = open_fifo(request, FifoEnd::Read)?;
    let response = open_fifo(response, FifoEnd::Write)?;
    let relay = open_fifo(relay, FifoEnd::Write)?;
    Ok(WorkerEnds {
        request,
        response,
        relay,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoEnd {
    Read,
    Write,
}

/// Blocking open of one end of a FIFO.
pub fn open_fifo(path: &Path, end: FifoEnd) -> io::Result<OwnedFd> {
    let file = match end {
        FifoEnd::Read => OpenOptions::new().read(true).open(path)?,
        FifoEnd::Write => OpenOptions::new().write(true).open(path)?,
    };
    Ok(OwnedFd::from(file))
}

/// Opening read-write never blocks and satisfies a pending open of either end.
fn unblock_fifo(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{FrameReader, FrameWriter, PipeFd};
    use crate::bridge::protocol::Response;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn create_makes_three_fifos_and_drop_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RendezvousPaths::create(dir.path()).unwrap();

        for path in paths.iter() {
            let meta = fs::metadata(path).unwrap();
            assert!(meta.file_type().is_fifo(), "{} is not a FIFO", path.display());
        }

        let kept: Vec<PathBuf> = paths.iter().map(Path::to_path_buf).collect();
        drop(paths);
        for path in kept {
            assert!(!path.exists());
        }
    }

    #[test]
    fn both_sides_rendezvous() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RendezvousPaths::create(dir.path()).unwrap();
        let (req, res, log) = (
            paths.request.clone(),
            paths.response.clone(),
            paths.relay.clone(),
        );

        let worker = std::thread::spawn(move || {
            let ends = open_worker_ends(&req, &res, &log).unwrap();
            let mut writer = FrameWriter::<Response>::new(PipeFd::new(ends.response));
            writer.send(Response::Ack).unwrap();
        });

        let ends = paths.open_coordinator_ends().unwrap();
        let mut reader = FrameReader::<Response>::new(PipeFd::new(ends.response));
        assert_eq!(reader.recv().unwrap(), Response::Ack);
        worker.join().unwrap();
    }

    #[test]
    fn unblock_releases_a_pending_open() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RendezvousPaths::create(dir.path()).unwrap();
        let (req, res) = (paths.request.clone(), paths.response.clone());

        let waiter = std::thread::spawn(move || {
            let request = open_fifo(&req, FifoEnd::Write).is_ok();
            let response = open_fifo(&res, FifoEnd::Read).is_ok();
            request && response
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        let held = paths.unblock();
        assert_eq!(held.len(), 3);

        assert!(waiter.join().unwrap());
    }
}
