//! An open card: geometry, FAT cache, authentication and handles.

use std::io::{Read, Write};
use std::num::NonZeroU32;

use log::{debug, info};

use crate::auth::{AuthSession, AuthState};
use crate::cluster::ClusterIo;
use crate::config::Config;
use crate::device::{AuthPort, BlockAdapter};
use crate::dir_entry::{decode_entries, encode_entry, DirectoryEntry, ENTRY_LEN};
use crate::fat::Fat;
use crate::handle::HandleTable;
use crate::superblock::{read_superblock, Superblock};
use crate::{Error, Result};

pub struct Session<D> {
    pub(crate) io: ClusterIo<D>,
    pub(crate) superblock: Superblock,
    pub(crate) fat: Fat,
    pub(crate) auth: AuthSession,
    pub(crate) handles: HandleTable,
    config: Config,
}

/// A directory's cluster chain and its records, slot order preserved.
pub(crate) struct Directory {
    pub chain: Vec<u32>,
    pub entries: Vec<DirectoryEntry>,
}

impl Directory {
    /// Slot and record of the live entry called `name`.
    pub fn find(&self, name: &str) -> Option<(u32, &DirectoryEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.is_visible() && entry.has_name(name))
            .map(|(slot, entry)| (slot as u32, entry))
    }

    /// First reusable slot past `.`/`..`, or the slot just past the end.
    pub fn free_slot(&self) -> u32 {
        self.entries
            .iter()
            .enumerate()
            .skip(2)
            .find(|(_, entry)| !entry.is_visible())
            .map_or(self.entries.len(), |(slot, _)| slot) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub version: String,
    pub page_len: u16,
    pub pages_per_cluster: u16,
    pub pages_per_block: u16,
    pub clusters_per_card: u32,
    pub cluster_size: usize,
    pub allocatable_clusters: u32,
    pub free_clusters: u32,
    pub card_flags: u8,
    pub bad_blocks: Vec<u32>,
    pub soft_errors: u64,
    pub auth_state: AuthState,
}

impl CardInfo {
    pub fn free_bytes(&self) -> u64 {
        u64::from(self.free_clusters) * self.cluster_size as u64
    }
}

impl<D: BlockAdapter> Session<D> {
    /// Reads the superblock and prepares an unauthenticated session.
    pub fn open(mut device: D, config: &Config) -> Result<Self> {
        let superblock = read_superblock(&mut device, config.io.spare_len)?;
        debug!(
            "opened card version {}: {} clusters of {} bytes",
            superblock.version,
            superblock.clusters_per_card,
            superblock.cluster_size()
        );
        Ok(Self {
            io: ClusterIo::new(device, &superblock, &config.io),
            fat: Fat::new(&superblock),
            auth: AuthSession::from_config(&config.auth)?,
            handles: HandleTable::default(),
            superblock,
            config: config.clone(),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn reset_auth(&mut self) {
        self.auth.reset();
    }

    pub fn device(&self) -> &D {
        self.io.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.io.device_mut()
    }

    /// Ends the session. Open handles and staged FAT changes are dropped.
    pub fn into_device(self) -> D {
        self.io.into_device()
    }

    pub fn soft_errors(&self) -> u64 {
        self.io.soft_errors()
    }

    pub(crate) fn is_root(&self, cluster: u32) -> bool {
        cluster == self.superblock.rootdir_cluster
    }

    /// Reads a directory chain. The first record must be a `.` directory
    /// record; anything else is a damaged directory, never an empty one.
    pub(crate) fn load_dir(&mut self, cluster: u32) -> Result<Directory> {
        let chain = self.fat.chain(&mut self.io, cluster)?;
        let mut bytes = Vec::with_capacity(chain.len() * self.io.cluster_size());
        for &link in &chain {
            bytes.extend_from_slice(&self.io.read_cluster(self.fat.absolute(link))?);
        }
        let entries = decode_entries(&bytes);
        let has_dot = entries
            .first()
            .is_some_and(|dot| dot.name == b"." && dot.is_dir());
        if !has_dot {
            return Err(Error::corrupt(
                cluster,
                "directory does not start with a `.` record",
            ));
        }
        Ok(Directory { chain, entries })
    }

    /// The root directory, described by its own `.` record.
    pub(crate) fn root_entry(&mut self) -> Result<DirectoryEntry> {
        let root = self.superblock.rootdir_cluster;
        let dir = self.load_dir(root)?;
        let dot = dir
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::Format("root directory has no `.` record".to_string()))?;
        Ok(DirectoryEntry {
            name: Vec::new(),
            cluster: root,
            parent_slot: 0,
            ..dot
        })
    }

    /// Rewrites one record of the directory starting at `dir_cluster`,
    /// growing the chain by a cluster when `slot` is just past its end.
    pub(crate) fn store_entry(
        &mut self,
        dir_cluster: u32,
        slot: u32,
        entry: &DirectoryEntry,
    ) -> Result<()> {
        let cluster_size = self.io.cluster_size();
        let per_cluster = (cluster_size / ENTRY_LEN) as u32;
        let index = (slot / per_cluster) as usize;
        let offset = (slot % per_cluster) as usize * ENTRY_LEN;
        let record = encode_entry(entry);
        let chain = self.fat.chain(&mut self.io, dir_cluster)?;

        if let Some(&cluster) = chain.get(index) {
            let absolute = self.fat.absolute(cluster);
            let mut data = self.io.read_cluster(absolute)?;
            data[offset..offset + ENTRY_LEN].copy_from_slice(&record);
            return self.io.write_cluster(absolute, &data);
        }
        let tail = match chain.last() {
            Some(&tail) if index == chain.len() => tail,
            _ => {
                return Err(Error::corrupt(
                    dir_cluster,
                    format!("slot {slot} beyond directory chain"),
                ))
            }
        };

        let cluster = self.fat.extend_chain(&mut self.io, tail, NonZeroU32::MIN)?;
        let mut data = vec![0u8; cluster_size];
        data[offset..offset + ENTRY_LEN].copy_from_slice(&record);
        let written = self
            .io
            .write_cluster(self.fat.absolute(cluster), &data)
            .and_then(|()| self.fat.flush(&mut self.io));
        if written.is_err() {
            self.fat.discard();
        }
        written
    }

    /// Records a new entry count in a directory's `.` record and in its
    /// entry in the parent.
    fn set_entry_count(&mut self, dir_cluster: u32, count: u32) -> Result<()> {
        let dir = self.load_dir(dir_cluster)?;
        let mut dot = dir
            .entries
            .first()
            .cloned()
            .ok_or_else(|| Error::corrupt(dir_cluster, "directory has no `.` record"))?;
        dot.entry_count = count;
        self.store_entry(dir_cluster, 0, &dot)?;
        if self.is_root(dir_cluster) {
            return Ok(());
        }

        let parent = self.load_dir(dot.cluster)?;
        let mut own = parent
            .entries
            .get(dot.parent_slot as usize)
            .filter(|entry| entry.is_dir() && entry.cluster == dir_cluster)
            .cloned()
            .ok_or_else(|| Error::corrupt(dir_cluster, "parent does not list this directory"))?;
        own.entry_count = count;
        self.store_entry(dot.cluster, dot.parent_slot, &own)
    }

    /// Writes `entry` into `slot` of a directory whose records were loaded
    /// as `dir`, bumping the entry count when the slot is new.
    pub(crate) fn place_entry(
        &mut self,
        dir_cluster: u32,
        dir: &Directory,
        slot: u32,
        entry: &DirectoryEntry,
    ) -> Result<()> {
        self.store_entry(dir_cluster, slot, entry)?;
        if slot as usize >= dir.entries.len() {
            self.set_entry_count(dir_cluster, slot + 1)?;
        }
        Ok(())
    }

    pub fn info(&mut self) -> Result<CardInfo> {
        let superblock = &self.superblock;
        let mut info = CardInfo {
            version: superblock.version.clone(),
            page_len: superblock.page_len,
            pages_per_cluster: superblock.pages_per_cluster,
            pages_per_block: superblock.pages_per_block,
            clusters_per_card: superblock.clusters_per_card,
            cluster_size: superblock.cluster_size(),
            allocatable_clusters: superblock.alloc_end,
            free_clusters: 0,
            card_flags: superblock.card_flags,
            bad_blocks: superblock
                .bad_block_list
                .iter()
                .copied()
                .filter(|&block| block != crate::superblock::NO_BAD_BLOCK)
                .collect(),
            soft_errors: 0,
            auth_state: self.auth.state(),
        };
        info.free_clusters = self.fat.free_clusters(&mut self.io)?;
        info.soft_errors = self.io.soft_errors();
        Ok(info)
    }

    /// Copies every raw page, spare area included, to `out` in page order.
    pub fn dump<W: Write>(&mut self, mut out: W) -> Result<u32> {
        let pages = self.superblock.total_pages();
        for page in 0..pages {
            out.write_all(&self.io.read_raw_page(page)?)?;
        }
        out.flush()?;
        info!("dumped {pages} pages");
        Ok(pages)
    }

    /// Replaces the whole card with a dump made by [`Session::dump`], then
    /// re-reads the superblock from it.
    pub fn restore<R: Read>(&mut self, mut input: R) -> Result<()> {
        self.auth.require()?;
        let raw_page_len = self.io.raw_page_len();
        let pages_per_block = u32::from(self.superblock.pages_per_block);
        let total_pages = self.superblock.total_pages();
        let mut image = Vec::new();
        input.read_to_end(&mut image)?;
        if image.len() != total_pages as usize * raw_page_len {
            return Err(Error::Format(format!(
                "dump holds {} bytes, the card needs {}",
                image.len(),
                total_pages as usize * raw_page_len
            )));
        }
        Superblock::parse(&image)?;

        self.handles.clear();
        self.fat.discard();
        for (block, pages) in image
            .chunks(raw_page_len * pages_per_block as usize)
            .enumerate()
        {
            let block = block as u32;
            self.io.erase_block(block)?;
            for (offset, raw) in pages.chunks(raw_page_len).enumerate() {
                self.io.write_raw_page(block * pages_per_block + offset as u32, raw)?;
            }
        }
        self.reload()?;
        info!("restored {total_pages} pages");
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        let spare_len = self.config.io.spare_len;
        let superblock = read_superblock(self.io.device_mut(), spare_len)?;
        self.fat = Fat::new(&superblock);
        self.superblock = superblock;
        Ok(())
    }

    /// Erases every block, leaving the card unformatted. Later filesystem
    /// calls on this session fail until a dump is restored.
    pub fn erase_card(&mut self) -> Result<()> {
        self.auth.require()?;
        self.handles.clear();
        self.fat = Fat::new(&self.superblock);
        let blocks = self.superblock.total_blocks();
        for block in 0..blocks {
            self.io.erase_block(block)?;
        }
        info!("erased {blocks} blocks");
        Ok(())
    }
}

impl<D: BlockAdapter + AuthPort> Session<D> {
    /// Runs the handshake, retrying as configured.
    pub fn authenticate(&mut self) -> Result<()> {
        self.auth.authenticate_with_retries(self.io.device_mut())?;
        Ok(())
    }
}
