//! Cluster to page translation with ECC on the way in and out.

use log::{trace, warn};

use crate::config::IoConfig;
use crate::device::BlockAdapter;
use crate::ecc::{self, PageCheck};
use crate::superblock::Superblock;
use crate::{Error, Result};

pub struct ClusterIo<D> {
    device: D,
    page_len: usize,
    spare_len: usize,
    pages_per_cluster: u32,
    pages_per_block: u32,
    erased: u8,
    ecc: bool,
    verify_writes: bool,
    erase_before_write: bool,
    soft_errors: u64,
}

impl<D: BlockAdapter> ClusterIo<D> {
    pub fn new(device: D, superblock: &Superblock, io: &IoConfig) -> Self {
        Self {
            device,
            page_len: usize::from(superblock.page_len),
            spare_len: io.spare_len.unwrap_or_else(|| superblock.spare_len()),
            pages_per_cluster: u32::from(superblock.pages_per_cluster),
            pages_per_block: u32::from(superblock.pages_per_block),
            erased: superblock.erased_byte(),
            ecc: superblock.has_ecc(),
            verify_writes: io.verify_writes,
            erase_before_write: io.erase_before_write,
            soft_errors: 0,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Number of ECC corrections performed so far.
    pub fn soft_errors(&self) -> u64 {
        self.soft_errors
    }

    pub fn cluster_size(&self) -> usize {
        self.page_len * self.pages_per_cluster as usize
    }

    pub fn raw_page_len(&self) -> usize {
        self.page_len + self.spare_len
    }

    pub fn pages_per_block(&self) -> u32 {
        self.pages_per_block
    }

    /// Reads a page as stored, data and spare, without ECC processing.
    pub fn read_raw_page(&mut self, page: u32) -> Result<Vec<u8>> {
        let raw = self.device.read_page(page)?;
        if raw.len() < self.raw_page_len() {
            return Err(Error::media(
                page,
                format!("short read: {} of {} bytes", raw.len(), self.raw_page_len()),
            ));
        }
        Ok(raw)
    }

    /// Reads the data area of a page, verifying and correcting it.
    pub fn read_page(&mut self, page: u32) -> Result<Vec<u8>> {
        trace!("read page {page}");
        let raw = self.read_raw_page(page)?;
        let mut data = raw[..self.page_len].to_vec();
        if !self.ecc {
            return Ok(data);
        }

        let spare = &raw[self.page_len..self.raw_page_len()];
        match ecc::check_page(&mut data, spare, self.erased) {
            PageCheck::Clean | PageCheck::Blank => Ok(data),
            PageCheck::Corrected(chunks) => {
                self.soft_errors += chunks as u64;
                warn!("page {page}: corrected ECC error in {chunks} chunk(s)");
                Ok(data)
            }
            PageCheck::Uncorrectable(chunk) => Err(Error::media(
                page,
                format!("uncorrectable ECC error in chunk {chunk}"),
            )),
        }
    }

    pub fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>> {
        let first = cluster * self.pages_per_cluster;
        let mut data = Vec::with_capacity(self.cluster_size());
        for page in first..first + self.pages_per_cluster {
            data.extend_from_slice(&self.read_page(page)?);
        }
        Ok(data)
    }

    /// Data followed by a freshly computed spare area.
    pub fn encode_page(&self, data: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.raw_page_len());
        raw.extend_from_slice(data);
        raw.resize(self.page_len, 0);
        if self.ecc {
            raw.extend_from_slice(&ecc::page_spare(&raw, self.spare_len));
        } else {
            raw.resize(self.raw_page_len(), self.erased);
        }
        raw
    }

    /// Writes a cluster, regenerating ECC for every page.
    ///
    /// On error the cluster's contents are undefined; nothing is rolled back.
    pub fn write_cluster(&mut self, cluster: u32, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= self.cluster_size());
        let first = cluster * self.pages_per_cluster;
        let pages: Vec<Vec<u8>> = (0..self.pages_per_cluster as usize)
            .map(|i| {
                let start = (i * self.page_len).min(data.len());
                let end = ((i + 1) * self.page_len).min(data.len());
                self.encode_page(&data[start..end])
            })
            .collect();

        if self.erase_before_write {
            self.rewrite_block(first, &pages)?;
        } else {
            for (page, raw) in (first..).zip(pages.iter()) {
                trace!("write page {page}");
                self.device.write_page(page, raw)?;
            }
        }

        if self.verify_writes {
            for (page, raw) in (first..).zip(pages.iter()) {
                let readback = self.read_raw_page(page)?;
                if readback[..raw.len()] != raw[..] {
                    return Err(Error::media(page, "write verification failed"));
                }
            }
        }
        Ok(())
    }

    /// Erases the block holding `first` and writes it back with `pages`
    /// replacing the cluster's pages.
    fn rewrite_block(&mut self, first: u32, pages: &[Vec<u8>]) -> Result<()> {
        let block = first / self.pages_per_block;
        let block_start = block * self.pages_per_block;
        let cluster_range = first..first + pages.len() as u32;

        let mut contents = Vec::with_capacity(self.pages_per_block as usize);
        for page in block_start..block_start + self.pages_per_block {
            if cluster_range.contains(&page) {
                contents.push(None);
            } else {
                let raw = self.read_raw_page(page)?;
                let blank = raw.iter().all(|&byte| byte == self.erased);
                contents.push(if blank { None } else { Some(raw) });
            }
        }

        trace!("erase block {block}");
        self.device.erase_block(block)?;
        // Once erased, every kept page must go back even if an earlier
        // write failed; the first failure is reported afterwards.
        let mut failure = None;
        for (page, kept) in (block_start..).zip(contents) {
            let raw = if cluster_range.contains(&page) {
                &pages[(page - first) as usize]
            } else {
                match &kept {
                    Some(raw) => raw,
                    None => continue,
                }
            };
            trace!("write page {page}");
            if let Err(err) = self.device.write_page(page, raw) {
                warn!("page {page}: write failed during block rewrite: {err}");
                failure.get_or_insert(err);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn write_raw_page(&mut self, page: u32, raw: &[u8]) -> Result<()> {
        self.device.write_page(page, raw)
    }

    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        self.device.erase_block(block)
    }
}
