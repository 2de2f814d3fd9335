use std::fs::File;
use std::path::Path;
use std::thread;

use log::error;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::core::GenericResult;

pub fn acquire_lock<P: AsRef<Path>>(path: P) -> GenericResult<Flock<File>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| format!(
        "Unable to open {:?}: {}", path, e))?;

    Ok(Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, err)| {
        if err == Errno::EAGAIN {
            format!("Unable to acquire an exclusive lock on {:?}: it's already locked by another process", path)
        } else {
            format!("Unable to flock() {:?}: {}", path, err)
        }
    })?)
}

pub fn spawn_thread<F, T>(name: &str, f: F) -> GenericResult<thread::JoinHandle<T>>
    where F: FnOnce() -> T, F: Send + 'static, T: Send + 'static
{
    thread::Builder::new().name(name.to_owned()).spawn(f).map_err(|e| format!(
        "Unable to spawn a thread: {}", e).into())
}

pub fn join_thread_ignoring_result<T>(handle: thread::JoinHandle<T>) {
    let name = get_thread_name(handle.thread());
    if let Err(err) = handle.join() {
        error!("{:?} thread has panicked: {:?}.", name, err)
    }
}

fn get_thread_name(thread: &thread::Thread) -> String {
    match thread.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", thread.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive() {
        let temp_dir = assert_fs::TempDir::new().unwrap();
        let path = temp_dir.join("config.yaml");
        std::fs::write(&path, "").unwrap();

        let lock = acquire_lock(&path).unwrap();
        let err = acquire_lock(&path).unwrap_err();
        assert!(err.to_string().contains("already locked"), "{}", err);

        drop(lock);
        acquire_lock(&path).unwrap();
    }
}
