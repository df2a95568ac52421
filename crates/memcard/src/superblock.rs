//! Card geometry, read from the superblock at the start of page 0.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::device::BlockAdapter;
use crate::ecc::{self, PageCheck};
use crate::{Error, Result};

pub const MAGIC: &[u8; 28] = b"Sony PS2 Memory Card Format ";
pub const SUPERBLOCK_LEN: usize = 0x154;

pub const CF_USE_ECC: u8 = 0x01;
pub const CF_BAD_BLOCK: u8 = 0x08;
pub const CF_ERASE_ZEROES: u8 = 0x10;

pub const IFC_LIST_LEN: usize = 32;
pub const BAD_BLOCK_LIST_LEN: usize = 32;
pub const NO_BAD_BLOCK: u32 = 0xFFFF_FFFF;

const UNUSED_FIELD: u16 = 0xFF00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: String,
    pub page_len: u16,
    pub pages_per_cluster: u16,
    pub pages_per_block: u16,
    pub clusters_per_card: u32,
    /// First allocatable cluster (absolute).
    pub alloc_offset: u32,
    /// Number of allocatable clusters.
    pub alloc_end: u32,
    /// Root directory cluster, relative to `alloc_offset`.
    pub rootdir_cluster: u32,
    pub backup_block1: u32,
    pub backup_block2: u32,
    /// Absolute cluster numbers of the indirect FAT clusters.
    pub ifc_list: [u32; IFC_LIST_LEN],
    pub bad_block_list: [u32; BAD_BLOCK_LIST_LEN],
    pub card_type: u8,
    pub card_flags: u8,
}

impl Superblock {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_LEN {
            return Err(Error::Format(format!(
                "superblock needs {SUPERBLOCK_LEN} bytes, page 0 holds {}",
                bytes.len()
            )));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::Format("missing superblock magic".to_string()));
        }

        let mut ifc_list = [0u32; IFC_LIST_LEN];
        LittleEndian::read_u32_into(&bytes[0x50..0xD0], &mut ifc_list);
        let mut bad_block_list = [0u32; BAD_BLOCK_LIST_LEN];
        LittleEndian::read_u32_into(&bytes[0xD0..0x150], &mut bad_block_list);

        let superblock = Self {
            version: String::from_utf8_lossy(&bytes[0x1C..0x28])
                .trim_end_matches('\0')
                .to_string(),
            page_len: LittleEndian::read_u16(&bytes[0x28..]),
            pages_per_cluster: LittleEndian::read_u16(&bytes[0x2A..]),
            pages_per_block: LittleEndian::read_u16(&bytes[0x2C..]),
            clusters_per_card: LittleEndian::read_u32(&bytes[0x30..]),
            alloc_offset: LittleEndian::read_u32(&bytes[0x34..]),
            alloc_end: LittleEndian::read_u32(&bytes[0x38..]),
            rootdir_cluster: LittleEndian::read_u32(&bytes[0x3C..]),
            backup_block1: LittleEndian::read_u32(&bytes[0x40..]),
            backup_block2: LittleEndian::read_u32(&bytes[0x44..]),
            ifc_list,
            bad_block_list,
            card_type: bytes[0x150],
            card_flags: bytes[0x151],
        };
        superblock.validate()?;
        Ok(superblock)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; SUPERBLOCK_LEN];
        bytes[..MAGIC.len()].copy_from_slice(MAGIC);
        let version = self.version.as_bytes();
        let version_len = version.len().min(12);
        bytes[0x1C..0x1C + version_len].copy_from_slice(&version[..version_len]);
        LittleEndian::write_u16(&mut bytes[0x28..], self.page_len);
        LittleEndian::write_u16(&mut bytes[0x2A..], self.pages_per_cluster);
        LittleEndian::write_u16(&mut bytes[0x2C..], self.pages_per_block);
        LittleEndian::write_u16(&mut bytes[0x2E..], UNUSED_FIELD);
        LittleEndian::write_u32(&mut bytes[0x30..], self.clusters_per_card);
        LittleEndian::write_u32(&mut bytes[0x34..], self.alloc_offset);
        LittleEndian::write_u32(&mut bytes[0x38..], self.alloc_end);
        LittleEndian::write_u32(&mut bytes[0x3C..], self.rootdir_cluster);
        LittleEndian::write_u32(&mut bytes[0x40..], self.backup_block1);
        LittleEndian::write_u32(&mut bytes[0x44..], self.backup_block2);
        LittleEndian::write_u32_into(&self.ifc_list, &mut bytes[0x50..0xD0]);
        LittleEndian::write_u32_into(&self.bad_block_list, &mut bytes[0xD0..0x150]);
        bytes[0x150] = self.card_type;
        bytes[0x151] = self.card_flags;
        bytes
    }

    pub fn validate(&self) -> Result<()> {
        let page_len = usize::from(self.page_len);
        if !self.page_len.is_power_of_two() || page_len % ecc::CHUNK_LEN != 0 {
            return Err(Error::Format(format!(
                "page length {} is not a power-of-two multiple of {}",
                self.page_len,
                ecc::CHUNK_LEN
            )));
        }
        if !self.pages_per_cluster.is_power_of_two() {
            return Err(Error::Format(format!(
                "pages per cluster {} is not a power of two",
                self.pages_per_cluster
            )));
        }
        if self.pages_per_block == 0 || self.pages_per_block % self.pages_per_cluster != 0 {
            return Err(Error::Format(format!(
                "pages per block {} is not a multiple of pages per cluster {}",
                self.pages_per_block, self.pages_per_cluster
            )));
        }
        let alloc_limit = u64::from(self.alloc_offset) + u64::from(self.alloc_end);
        if self.alloc_end == 0 || alloc_limit > u64::from(self.clusters_per_card) {
            return Err(Error::Format(format!(
                "allocatable range {}+{} exceeds {} clusters",
                self.alloc_offset, self.alloc_end, self.clusters_per_card
            )));
        }
        let total_pages = u64::from(self.clusters_per_card) * u64::from(self.pages_per_cluster);
        if total_pages > u64::from(u32::MAX) {
            return Err(Error::Format(format!(
                "{} clusters of {} pages do not fit the page address space",
                self.clusters_per_card, self.pages_per_cluster
            )));
        }
        if self.rootdir_cluster >= self.alloc_end {
            return Err(Error::Format(format!(
                "root directory cluster {} outside allocatable range",
                self.rootdir_cluster
            )));
        }
        if self.ifc_list[0] == 0 || self.ifc_list[0] >= self.clusters_per_card {
            return Err(Error::Format(format!(
                "indirect FAT cluster {} is not on the card",
                self.ifc_list[0]
            )));
        }
        Ok(())
    }

    pub fn has_ecc(&self) -> bool {
        self.card_flags & CF_USE_ECC != 0
    }

    pub fn may_have_bad_blocks(&self) -> bool {
        self.card_flags & CF_BAD_BLOCK != 0
    }

    /// Byte value of an erased page.
    pub fn erased_byte(&self) -> u8 {
        if self.card_flags & CF_ERASE_ZEROES != 0 {
            0x00
        } else {
            0xFF
        }
    }

    /// Spare bytes following each page: three ECC bytes per 128-byte chunk,
    /// rounded up to `page_len / 32`.
    pub fn spare_len(&self) -> usize {
        if self.has_ecc() {
            usize::from(self.page_len) / 32
        } else {
            0
        }
    }

    pub fn cluster_size(&self) -> usize {
        usize::from(self.page_len) * usize::from(self.pages_per_cluster)
    }

    pub fn fat_entries_per_cluster(&self) -> u32 {
        (self.cluster_size() / 4) as u32
    }

    pub fn clusters_per_block(&self) -> u32 {
        u32::from(self.pages_per_block / self.pages_per_cluster)
    }

    pub fn total_pages(&self) -> u32 {
        self.clusters_per_card * u32::from(self.pages_per_cluster)
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_pages() / u32::from(self.pages_per_block)
    }

    /// Whether an absolute cluster lies in a block listed as bad.
    pub fn is_bad_cluster(&self, cluster: u32) -> bool {
        let block = cluster / self.clusters_per_block();
        self.bad_block_list
            .iter()
            .any(|&bad| bad != NO_BAD_BLOCK && bad == block)
    }
}

/// Reads and parses the superblock from page 0.
///
/// `spare_len` overrides the spare length implied by the card flags. When
/// the card uses ECC, page 0 is verified and a corrected copy re-parsed.
pub fn read_superblock<D: BlockAdapter>(
    device: &mut D,
    spare_len: Option<usize>,
) -> Result<Superblock> {
    let raw = device.read_page(0)?;
    let superblock = Superblock::parse(&raw)?;
    if !superblock.has_ecc() {
        return Ok(superblock);
    }

    let page_len = usize::from(superblock.page_len);
    let spare_len = spare_len.unwrap_or_else(|| superblock.spare_len());
    if raw.len() < page_len + spare_len {
        return Err(Error::media(0, "short page read"));
    }
    let mut data = raw[..page_len].to_vec();
    let spare = &raw[page_len..page_len + spare_len];
    match ecc::check_page(&mut data, spare, superblock.erased_byte()) {
        PageCheck::Clean | PageCheck::Blank => Ok(superblock),
        PageCheck::Corrected(chunks) => {
            warn!("corrected {chunks} ECC chunk(s) in the superblock page");
            let corrected = Superblock::parse(&data)?;
            debug!("superblock re-parsed after ECC correction");
            Ok(corrected)
        }
        PageCheck::Uncorrectable(chunk) => Err(Error::media(
            0,
            format!("uncorrectable ECC error in chunk {chunk} of the superblock"),
        )),
    }
}
