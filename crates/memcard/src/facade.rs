//! The filesystem verbs.

use std::num::NonZeroU32;
use std::path::Path;

use log::{debug, info};

use crate::device::BlockAdapter;
use crate::dir_entry::{encode_entry, DirectoryEntry, Timestamp, ENTRY_LEN};
use crate::handle::OpenMode;
use crate::path::{split_parent, Location, Resolved};
use crate::session::Session;
use crate::{Error, Result};

impl<D: BlockAdapter> Session<D> {
    /// Live entries of a directory, `.` and `..` excluded.
    pub fn list(&mut self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let dir = self.resolve_dir(path)?;
        let handle = self.open_handle(&dir, OpenMode::DirIterating)?;
        let mut entries = Vec::new();
        let listed = loop {
            match self.read_dir_entry(handle) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break Ok(entries),
                Err(err) => break Err(err),
            }
        };
        self.close(handle)?;
        listed
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let file = self.resolve(path)?;
        if !file.entry.is_file() {
            return Err(Error::NotFile(path.to_string()));
        }
        let handle = self.open_handle(&file, OpenMode::Read)?;
        let data = self.read(handle, file.entry.size as usize);
        self.close(handle)?;
        data
    }

    /// Copies a card file to `destination`. The file is read completely
    /// before the destination is created.
    pub fn extract(&mut self, path: &str, destination: &Path) -> Result<u64> {
        let data = self.read_file(path)?;
        std::fs::write(destination, &data)?;
        info!("extracted {path} ({} bytes)", data.len());
        Ok(data.len() as u64)
    }

    /// Creates or replaces the file at `path`.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.auth.require()?;
        let target = match self.resolve(path) {
            Ok(existing) if existing.entry.is_file() => existing,
            Ok(_) => return Err(Error::AlreadyExists(path.to_string())),
            Err(Error::NotFound(_)) => self.create_file(path)?,
            Err(err) => return Err(err),
        };

        let handle = self.open_handle(&target, OpenMode::Write)?;
        if let Err(err) = self.write(handle, data) {
            self.abandon(handle)?;
            return Err(err);
        }
        self.close(handle)?;
        debug!("wrote {path} ({} bytes)", data.len());
        Ok(())
    }

    pub fn inject(&mut self, source: &Path, path: &str) -> Result<u64> {
        let data = std::fs::read(source)?;
        self.write_file(path, &data)?;
        info!("injected {} as {path} ({} bytes)", source.display(), data.len());
        Ok(data.len() as u64)
    }

    fn create_file(&mut self, path: &str) -> Result<Resolved> {
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve_dir(&parent_path)?.entry.cluster;
        let dir = self.load_dir(parent)?;
        let slot = dir.free_slot();
        let entry = DirectoryEntry::new_file(&name, Timestamp::now());
        self.place_entry(parent, &dir, slot, &entry)?;
        Ok(Resolved {
            entry,
            location: Location::Slot { parent, slot },
        })
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.auth.require()?;
        let (parent_path, name) = split_parent(path)?;
        let parent = self.resolve_dir(&parent_path)?.entry.cluster;
        let dir = self.load_dir(parent)?;
        if dir.find(&name).is_some() {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        let slot = dir.free_slot();

        let now = Timestamp::now();
        let cluster = self.fat.allocate_chain(&mut self.io, NonZeroU32::MIN)?;
        let mut records = Vec::with_capacity(2 * ENTRY_LEN);
        records.extend_from_slice(&encode_entry(&DirectoryEntry::dot(parent, slot, now)));
        records.extend_from_slice(&encode_entry(&DirectoryEntry::dot_dot(now)));
        let created = self
            .io
            .write_cluster(self.fat.absolute(cluster), &records)
            .and_then(|()| self.fat.flush(&mut self.io));
        if let Err(err) = created {
            self.fat.discard();
            return Err(err);
        }

        let entry = DirectoryEntry::new_directory(&name, cluster, now);
        self.place_entry(parent, &dir, slot, &entry)?;
        info!("created directory {path}");
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.auth.require()?;
        let file = self.resolve(path)?;
        if !file.entry.is_file() {
            return Err(Error::NotFile(path.to_string()));
        }
        self.delete(file)?;
        info!("removed {path}");
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.auth.require()?;
        let dir = self.resolve(path)?;
        if !dir.entry.is_dir() {
            return Err(Error::NotDirectory(path.to_string()));
        }
        if dir.location == Location::Root {
            return Err(Error::InvalidName(path.to_string()));
        }
        let contents = self.load_dir(dir.entry.cluster)?;
        if contents.entries.iter().any(DirectoryEntry::is_visible) {
            return Err(Error::NotEmpty(path.to_string()));
        }
        self.delete(dir)?;
        info!("removed directory {path}");
        Ok(())
    }

    /// Clears EXISTS on the record, then frees its chain.
    fn delete(&mut self, resolved: Resolved) -> Result<()> {
        let Location::Slot { parent, slot } = resolved.location else {
            return Err(Error::InvalidName("/".to_string()));
        };
        let mut entry = resolved.entry;
        let start = entry.start_cluster();
        entry.mark_deleted();
        self.store_entry(parent, slot, &entry)?;
        if let Some(start) = start {
            let freed = self
                .fat
                .free_chain(&mut self.io, start)
                .and_then(|_| self.fat.flush(&mut self.io));
            if freed.is_err() {
                self.fat.discard();
            }
            freed?;
        }
        Ok(())
    }
}
