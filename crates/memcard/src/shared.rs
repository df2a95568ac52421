//! A session shared between threads.
//!
//! Every verb runs under one coarse lock, held through the commit, so
//! callers never observe a half-written file.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{AuthPort, BlockAdapter};
use crate::dir_entry::DirectoryEntry;
use crate::session::Session;
use crate::Result;

pub struct SharedSession<D> {
    inner: Arc<Mutex<Session<D>>>,
}

impl<D> Clone for SharedSession<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: BlockAdapter> SharedSession<D> {
    pub fn new(session: Session<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// A panic inside another caller's operation does not poison the card;
    /// the next caller sees whatever was committed.
    pub fn lock(&self) -> MutexGuard<'_, Session<D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, op: impl FnOnce(&mut Session<D>) -> Result<R>) -> Result<R> {
        op(&mut self.lock())
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        self.with(|session| session.list(path))
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.with(|session| session.read_file(path))
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.with(|session| session.write_file(path, data))
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.with(|session| session.mkdir(path))
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        self.with(|session| session.remove(path))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.with(|session| session.rmdir(path))
    }

    pub fn extract(&self, path: &str, destination: &Path) -> Result<u64> {
        self.with(|session| session.extract(path, destination))
    }

    pub fn inject(&self, source: &Path, path: &str) -> Result<u64> {
        self.with(|session| session.inject(source, path))
    }

    /// Returns the session once every other clone has been dropped.
    pub fn try_unwrap(self) -> std::result::Result<Session<D>, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(PoisonError::into_inner)),
            Err(inner) => Err(Self { inner }),
        }
    }
}

impl<D: BlockAdapter + AuthPort> SharedSession<D> {
    pub fn authenticate(&self) -> Result<()> {
        self.with(Session::authenticate)
    }
}
