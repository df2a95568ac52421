//! The file allocation table.
//!
//! Links are 32-bit words indexed by cluster number relative to
//! `alloc_offset`, reached through two levels of indirection: the
//! superblock's IFC list names indirect clusters, whose words name the FAT
//! clusters holding the links themselves.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::iter::FusedIterator;
use std::num::NonZeroU32;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::cluster::ClusterIo;
use crate::device::BlockAdapter;
use crate::superblock::{Superblock, IFC_LIST_LEN, NO_BAD_BLOCK};
use crate::{Error, Result};

pub const ALLOCATED: u32 = 0x8000_0000;
pub const LINK_MASK: u32 = 0x7FFF_FFFF;
pub const FAT_FREE: u32 = 0x7FFF_FFFF;
pub const FAT_END_OF_CHAIN: u32 = 0xFFFF_FFFF;
pub const FAT_BAD: u32 = 0xFFFF_FFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatLink {
    Free,
    EndOfChain,
    Bad,
    Next(u32),
}

impl FatLink {
    pub fn decode(raw: u32) -> Self {
        match raw {
            FAT_END_OF_CHAIN => FatLink::EndOfChain,
            FAT_BAD => FatLink::Bad,
            raw if raw & ALLOCATED == 0 => FatLink::Free,
            raw => FatLink::Next(raw & LINK_MASK),
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            FatLink::Free => FAT_FREE,
            FatLink::EndOfChain => FAT_END_OF_CHAIN,
            FatLink::Bad => FAT_BAD,
            FatLink::Next(cluster) => ALLOCATED | cluster,
        }
    }
}

struct FatCluster {
    entries: Vec<u32>,
    dirty: bool,
}

pub struct Fat {
    ifc_list: [u32; IFC_LIST_LEN],
    alloc_offset: u32,
    alloc_end: u32,
    clusters_per_card: u32,
    clusters_per_block: u32,
    entries_per_cluster: u32,
    bad_blocks: Vec<u32>,
    /// No free cluster lies below this index.
    free_hint: u32,
    indirect: HashMap<u32, Vec<u32>>,
    tables: BTreeMap<u32, FatCluster>,
}

impl Fat {
    pub fn new(superblock: &Superblock) -> Self {
        Self {
            ifc_list: superblock.ifc_list,
            alloc_offset: superblock.alloc_offset,
            alloc_end: superblock.alloc_end,
            clusters_per_card: superblock.clusters_per_card,
            clusters_per_block: superblock.clusters_per_block(),
            entries_per_cluster: superblock.fat_entries_per_cluster(),
            bad_blocks: superblock
                .bad_block_list
                .iter()
                .copied()
                .filter(|&block| block != NO_BAD_BLOCK)
                .collect(),
            free_hint: 0,
            indirect: HashMap::new(),
            tables: BTreeMap::new(),
        }
    }

    /// Number of allocatable clusters.
    pub fn alloc_end(&self) -> u32 {
        self.alloc_end
    }

    /// Absolute cluster number of a relative one.
    pub fn absolute(&self, cluster: u32) -> u32 {
        self.alloc_offset + cluster
    }

    fn in_bad_block(&self, cluster: u32) -> bool {
        let block = self.absolute(cluster) / self.clusters_per_block;
        self.bad_blocks.contains(&block)
    }

    fn load_words<D: BlockAdapter>(
        &self,
        io: &mut ClusterIo<D>,
        cluster: u32,
        what: &str,
    ) -> Result<Vec<u32>> {
        if cluster == 0 || cluster >= self.clusters_per_card {
            return Err(Error::Format(format!(
                "{what} cluster {cluster} is not on the card"
            )));
        }
        let bytes = io.read_cluster(cluster)?;
        let mut words = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(&bytes, &mut words);
        Ok(words)
    }

    /// Finds the FAT cluster and word offset holding the link of `index`.
    fn locate<D: BlockAdapter>(
        &mut self,
        io: &mut ClusterIo<D>,
        index: u32,
    ) -> Result<(u32, usize)> {
        if index >= self.alloc_end {
            return Err(Error::corrupt(index, "cluster outside the allocatable range"));
        }
        let per_cluster = self.entries_per_cluster;
        let fat_offset = (index % per_cluster) as usize;
        let indirect_index = index / per_cluster;
        let indirect_offset = (indirect_index % per_cluster) as usize;
        let dbl_indirect = (indirect_index / per_cluster) as usize;

        let ifc = *self
            .ifc_list
            .get(dbl_indirect)
            .ok_or_else(|| Error::corrupt(index, "beyond the indirect FAT list"))?;
        if !self.indirect.contains_key(&ifc) {
            let words = self.load_words(io, ifc, "indirect FAT")?;
            self.indirect.insert(ifc, words);
        }
        let fat_cluster = self.indirect[&ifc][indirect_offset];
        if !self.tables.contains_key(&fat_cluster) {
            let entries = self.load_words(io, fat_cluster, "FAT")?;
            self.tables.insert(
                fat_cluster,
                FatCluster {
                    entries,
                    dirty: false,
                },
            );
        }
        Ok((fat_cluster, fat_offset))
    }

    pub fn raw_entry<D: BlockAdapter>(&mut self, io: &mut ClusterIo<D>, index: u32) -> Result<u32> {
        let (fat_cluster, offset) = self.locate(io, index)?;
        Ok(self.tables[&fat_cluster].entries[offset])
    }

    fn set_raw<D: BlockAdapter>(
        &mut self,
        io: &mut ClusterIo<D>,
        index: u32,
        raw: u32,
    ) -> Result<()> {
        let (fat_cluster, offset) = self.locate(io, index)?;
        if let Some(table) = self.tables.get_mut(&fat_cluster) {
            table.entries[offset] = raw;
            table.dirty = true;
        }
        Ok(())
    }

    pub fn link<D: BlockAdapter>(&mut self, io: &mut ClusterIo<D>, index: u32) -> Result<FatLink> {
        let link = FatLink::decode(self.raw_entry(io, index)?);
        if let FatLink::Next(next) = link {
            if next >= self.alloc_end {
                return Err(Error::corrupt(
                    index,
                    format!("links to cluster {next} outside the allocatable range"),
                ));
            }
        }
        Ok(link)
    }

    /// Lazily walks the chain starting at `start`.
    pub fn walk_chain<'a, D: BlockAdapter>(
        &'a mut self,
        io: &'a mut ClusterIo<D>,
        start: u32,
    ) -> ChainWalk<'a, D> {
        ChainWalk {
            fat: self,
            io,
            next: Some(start),
            visited: HashSet::new(),
        }
    }

    pub fn chain<D: BlockAdapter>(&mut self, io: &mut ClusterIo<D>, start: u32) -> Result<Vec<u32>> {
        self.walk_chain(io, start).collect()
    }

    fn find_free<D: BlockAdapter>(
        &mut self,
        io: &mut ClusterIo<D>,
        count: u32,
    ) -> Result<Vec<u32>> {
        let mut found = Vec::with_capacity(count as usize);
        for index in self.free_hint..self.alloc_end {
            if found.len() == count as usize {
                break;
            }
            if self.in_bad_block(index) {
                continue;
            }
            if FatLink::decode(self.raw_entry(io, index)?) == FatLink::Free {
                found.push(index);
            }
        }
        if found.len() < count as usize {
            return Err(Error::NoSpace {
                requested: count,
                available: found.len() as u32,
            });
        }
        Ok(found)
    }

    fn link_clusters<D: BlockAdapter>(
        &mut self,
        io: &mut ClusterIo<D>,
        clusters: &[u32],
    ) -> Result<()> {
        for pair in clusters.windows(2) {
            self.set_raw(io, pair[0], FatLink::Next(pair[1]).encode())?;
        }
        if let Some(&last) = clusters.last() {
            self.set_raw(io, last, FAT_END_OF_CHAIN)?;
        }
        Ok(())
    }

    /// Allocates `count` clusters first-fit by ascending index and links
    /// them. Nothing is staged when there is not enough space.
    pub fn allocate_chain<D: BlockAdapter>(
        &mut self,
        io: &mut ClusterIo<D>,
        count: NonZeroU32,
    ) -> Result<u32> {
        let clusters = self.find_free(io, count.get())?;
        self.link_clusters(io, &clusters)?;
        if let Some(&last) = clusters.last() {
            self.free_hint = last + 1;
        }
        debug!("allocated chain {clusters:?}");
        Ok(clusters[0])
    }

    /// Appends `count` new clusters after `tail`, which must end its chain.
    pub fn extend_chain<D: BlockAdapter>(
        &mut self,
        io: &mut ClusterIo<D>,
        tail: u32,
        count: NonZeroU32,
    ) -> Result<u32> {
        if self.link(io, tail)? != FatLink::EndOfChain {
            return Err(Error::corrupt(tail, "extended cluster does not end its chain"));
        }
        let first = self.allocate_chain(io, count)?;
        self.set_raw(io, tail, FatLink::Next(first).encode())?;
        Ok(first)
    }

    /// Marks every cluster of the chain free, keeping the old links in the
    /// low bits. The whole chain is validated before anything changes.
    pub fn free_chain<D: BlockAdapter>(&mut self, io: &mut ClusterIo<D>, start: u32) -> Result<u32> {
        let chain = self.chain(io, start)?;
        for &cluster in &chain {
            let raw = self.raw_entry(io, cluster)?;
            self.set_raw(io, cluster, raw & LINK_MASK)?;
            self.free_hint = self.free_hint.min(cluster);
        }
        debug!("freed {} cluster(s) starting at {start}", chain.len());
        Ok(chain.len() as u32)
    }

    pub fn free_clusters<D: BlockAdapter>(&mut self, io: &mut ClusterIo<D>) -> Result<u32> {
        let mut free = 0;
        for index in 0..self.alloc_end {
            if !self.in_bad_block(index)
                && FatLink::decode(self.raw_entry(io, index)?) == FatLink::Free
            {
                free += 1;
            }
        }
        Ok(free)
    }

    pub fn is_dirty(&self) -> bool {
        self.tables.values().any(|table| table.dirty)
    }

    /// Rewrites every FAT cluster holding staged changes.
    pub fn flush<D: BlockAdapter>(&mut self, io: &mut ClusterIo<D>) -> Result<()> {
        for (&cluster, table) in self.tables.iter_mut().filter(|(_, t)| t.dirty) {
            let mut bytes = vec![0u8; table.entries.len() * 4];
            LittleEndian::write_u32_into(&table.entries, &mut bytes);
            io.write_cluster(cluster, &bytes)?;
            table.dirty = false;
            debug!("flushed FAT cluster {cluster}");
        }
        Ok(())
    }

    /// Drops staged changes; the next access reloads from the card.
    pub fn discard(&mut self) {
        self.free_hint = 0;
        self.tables.retain(|_, table| !table.dirty);
    }
}

pub struct ChainWalk<'a, D> {
    fat: &'a mut Fat,
    io: &'a mut ClusterIo<D>,
    next: Option<u32>,
    visited: HashSet<u32>,
}

impl<D: BlockAdapter> ChainWalk<'_, D> {
    fn successor(&mut self, cluster: u32) -> Result<Option<u32>> {
        if !self.visited.insert(cluster) {
            return Err(Error::corrupt(cluster, "cycle in cluster chain"));
        }
        match self.fat.link(self.io, cluster)? {
            FatLink::Next(next) => Ok(Some(next)),
            FatLink::EndOfChain => Ok(None),
            FatLink::Free => Err(Error::corrupt(cluster, "free cluster inside a chain")),
            FatLink::Bad => Err(Error::corrupt(cluster, "bad cluster inside a chain")),
        }
    }
}

impl<D: BlockAdapter> Iterator for ChainWalk<'_, D> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = self.next.take()?;
        match self.successor(cluster) {
            Ok(next) => {
                self.next = next;
                Some(Ok(cluster))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

impl<D: BlockAdapter> FusedIterator for ChainWalk<'_, D> {}
