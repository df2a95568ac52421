//! Open files and directories.
//!
//! A handle pins one directory record and its location. Read handles walk
//! a chain validated at open; write handles build a fresh chain whose FAT
//! links stay staged until [`Session::close`] commits them together with
//! the updated record.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use log::debug;

use crate::cluster::ClusterIo;
use crate::device::BlockAdapter;
use crate::dir_entry::{DirectoryEntry, Timestamp, NO_CLUSTER};
use crate::fat::Fat;
use crate::path::{Location, Resolved};
use crate::session::Session;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "handle {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Replaces the file's contents; the old chain is freed on close.
    Write,
    DirIterating,
}

enum Cursor {
    Read {
        chain: Vec<u32>,
        index: usize,
        offset: usize,
        remaining: u32,
        current: Option<Vec<u8>>,
    },
    Write(PendingWrite),
    Dir {
        entries: Vec<DirectoryEntry>,
        next: usize,
    },
}

/// A write handle's new chain, built alongside the file's current one.
struct PendingWrite {
    first: Option<u32>,
    tail: Option<u32>,
    buffer: Vec<u8>,
    size: u32,
    previous: Option<u32>,
}

pub(crate) struct Handle {
    entry: DirectoryEntry,
    location: Location,
    cursor: Cursor,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    next_id: u32,
    open: BTreeMap<HandleId, Handle>,
}

impl HandleTable {
    fn insert(&mut self, handle: Handle) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.open.insert(id, handle);
        id
    }

    fn get_mut(&mut self, id: HandleId) -> Result<&mut Handle> {
        self.open
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn remove(&mut self, id: HandleId) -> Result<Handle> {
        self.open
            .remove(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }
}

/// Allocates one cluster after `tail` (or a new chain) and writes `data`
/// into it. The cluster stays unreachable until the FAT is flushed.
fn append_cluster<D: BlockAdapter>(
    fat: &mut Fat,
    io: &mut ClusterIo<D>,
    first: &mut Option<u32>,
    tail: &mut Option<u32>,
    data: &[u8],
) -> Result<()> {
    let cluster = match *tail {
        Some(tail) => fat.extend_chain(io, tail, NonZeroU32::MIN)?,
        None => fat.allocate_chain(io, NonZeroU32::MIN)?,
    };
    io.write_cluster(fat.absolute(cluster), data)?;
    first.get_or_insert(cluster);
    *tail = Some(cluster);
    Ok(())
}

impl<D: BlockAdapter> Session<D> {
    pub fn open_handle(&mut self, resolved: &Resolved, mode: OpenMode) -> Result<HandleId> {
        let entry = &resolved.entry;
        let cursor = match mode {
            OpenMode::Read => {
                if !entry.is_file() {
                    return Err(Error::NotFile(entry.display_name().into_owned()));
                }
                let chain = match entry.start_cluster() {
                    Some(start) => self.fat.chain(&mut self.io, start)?,
                    None => Vec::new(),
                };
                let needed = (entry.size as usize).div_ceil(self.io.cluster_size());
                if chain.len() < needed {
                    return Err(Error::corrupt(
                        entry.cluster,
                        format!(
                            "{} holds {} bytes in {} cluster(s)",
                            entry.display_name(),
                            entry.size,
                            chain.len()
                        ),
                    ));
                }
                Cursor::Read {
                    chain,
                    index: 0,
                    offset: 0,
                    remaining: entry.size,
                    current: None,
                }
            }
            OpenMode::Write => {
                self.auth.require()?;
                if !entry.is_file() {
                    return Err(Error::NotFile(entry.display_name().into_owned()));
                }
                Cursor::Write(PendingWrite {
                    first: None,
                    tail: None,
                    buffer: Vec::new(),
                    size: 0,
                    previous: entry.start_cluster(),
                })
            }
            OpenMode::DirIterating => {
                if !entry.is_dir() {
                    return Err(Error::NotDirectory(entry.display_name().into_owned()));
                }
                Cursor::Dir {
                    entries: self.load_dir(entry.cluster)?.entries,
                    next: 0,
                }
            }
        };
        let id = self.handles.insert(Handle {
            entry: entry.clone(),
            location: resolved.location,
            cursor,
        });
        debug!("opened {id} on {:?} as {mode:?}", entry.display_name());
        Ok(id)
    }

    /// Reads up to `count` bytes; fewer only at end of file.
    pub fn read(&mut self, id: HandleId, count: usize) -> Result<Vec<u8>> {
        let cluster_size = self.io.cluster_size();
        let handle = self.handles.get_mut(id)?;
        let Cursor::Read {
            chain,
            index,
            offset,
            remaining,
            current,
        } = &mut handle.cursor
        else {
            return Err(Error::NotFile(handle.entry.display_name().into_owned()));
        };

        let mut out = Vec::with_capacity(count.min(*remaining as usize));
        while out.len() < count && *remaining > 0 {
            let data = match current.take() {
                Some(data) => data,
                None => {
                    let cluster = *chain.get(*index).ok_or_else(|| {
                        Error::corrupt(handle.entry.cluster, "chain ended before the file")
                    })?;
                    self.io.read_cluster(self.fat.absolute(cluster))?
                }
            };
            let take = (cluster_size - *offset)
                .min(count - out.len())
                .min(*remaining as usize);
            out.extend_from_slice(&data[*offset..*offset + take]);
            *offset += take;
            *remaining -= take as u32;
            if *offset == cluster_size {
                *offset = 0;
                *index += 1;
            } else {
                *current = Some(data);
            }
        }
        Ok(out)
    }

    /// Next live record of a directory handle, skipping `.`, `..`, deleted
    /// and unused slots. Keeps returning `None` once exhausted.
    pub fn read_dir_entry(&mut self, id: HandleId) -> Result<Option<DirectoryEntry>> {
        let handle = self.handles.get_mut(id)?;
        let Cursor::Dir { entries, next } = &mut handle.cursor else {
            return Err(Error::NotDirectory(handle.entry.display_name().into_owned()));
        };
        while let Some(entry) = entries.get(*next) {
            *next += 1;
            if entry.is_visible() {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    /// Appends `bytes`. Every completed cluster is written to a freshly
    /// allocated cluster straight away.
    pub fn write(&mut self, id: HandleId, bytes: &[u8]) -> Result<()> {
        let cluster_size = self.io.cluster_size();
        let handle = self.handles.get_mut(id)?;
        let Cursor::Write(pending) = &mut handle.cursor else {
            return Err(Error::NotFile(handle.entry.display_name().into_owned()));
        };

        let new_size = u32::try_from(u64::from(pending.size) + bytes.len() as u64).map_err(|_| {
            Error::NoSpace {
                requested: u32::MAX,
                available: self.fat.alloc_end(),
            }
        })?;
        pending.buffer.extend_from_slice(bytes);
        while pending.buffer.len() >= cluster_size {
            let data: Vec<u8> = pending.buffer.drain(..cluster_size).collect();
            append_cluster(
                &mut self.fat,
                &mut self.io,
                &mut pending.first,
                &mut pending.tail,
                &data,
            )?;
        }
        pending.size = new_size;
        Ok(())
    }

    /// Releases a handle. For a write handle this is the commit: the last
    /// partial cluster is written, the FAT flushed, the record rewritten
    /// and the replaced chain freed. The handle is gone afterwards even if
    /// the commit fails, in which case the card state must be re-verified.
    pub fn close(&mut self, id: HandleId) -> Result<()> {
        let handle = self.handles.remove(id)?;
        let Cursor::Write(pending) = handle.cursor else {
            return Ok(());
        };
        let committed = self.commit(handle.entry, handle.location, pending);
        if committed.is_err() {
            self.fat.discard();
        }
        committed
    }

    fn commit(
        &mut self,
        entry: DirectoryEntry,
        location: Location,
        mut pending: PendingWrite,
    ) -> Result<()> {
        let Location::Slot { parent, slot } = location else {
            return Err(Error::NotFile("/".to_string()));
        };
        if !pending.buffer.is_empty() {
            append_cluster(
                &mut self.fat,
                &mut self.io,
                &mut pending.first,
                &mut pending.tail,
                &pending.buffer,
            )?;
        }
        self.fat.flush(&mut self.io)?;

        let entry = DirectoryEntry {
            cluster: pending.first.unwrap_or(NO_CLUSTER),
            size: pending.size,
            modified: Timestamp::now(),
            ..entry
        };
        self.store_entry(parent, slot, &entry)?;

        if let Some(previous) = pending.previous {
            self.fat.free_chain(&mut self.io, previous)?;
            self.fat.flush(&mut self.io)?;
        }
        debug!("committed {:?}: {} bytes", entry.display_name(), entry.size);
        Ok(())
    }

    /// Drops a handle without committing. Staged FAT changes are discarded;
    /// clusters already written stay unreferenced.
    pub fn abandon(&mut self, id: HandleId) -> Result<()> {
        let handle = self.handles.remove(id)?;
        if matches!(handle.cursor, Cursor::Write { .. }) {
            self.fat.discard();
            debug!("abandoned {id}");
        }
        Ok(())
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}
