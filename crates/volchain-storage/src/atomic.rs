// volchain-storage/src/atomic.rs

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const CREATE_RETRIES: u32 = 5;

/// Write `bytes` to `path` atomically.
///
/// The data goes to `<path>.tmp`, is fsynced, then renamed over `path`; the
/// parent directory is fsynced last. A reader sees either the old or the new
/// contents, never a prefix.
pub fn write_atomic<P: AsRef<Path>>(path: P, bytes: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let tmp_path = tmp_path(path);

    let mut attempts = 0;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
            Ok(mut file) => {
                file.write_all(bytes)?;
                file.sync_all()?;
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempts < CREATE_RETRIES => {
                attempts += 1;
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // leftover from a crashed writer
                fs::remove_file(&tmp_path)?;
            }
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    fsync_parent(path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(target_family = "unix")]
pub(crate) fn fsync_parent(path: &Path) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    File::open(parent)?.sync_all()
}

#[cfg(not(target_family = "unix"))]
pub(crate) fn fsync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
