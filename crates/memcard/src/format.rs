//! Lays out a fresh, empty card image.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::cluster::ClusterIo;
use crate::config::IoConfig;
use crate::dir_entry::{encode_entry, DirectoryEntry, Timestamp, ENTRY_LEN};
use crate::fat::{FAT_BAD, FAT_END_OF_CHAIN, FAT_FREE};
use crate::image::ImageCard;
use crate::superblock::{
    Superblock, BAD_BLOCK_LIST_LEN, CF_BAD_BLOCK, CF_USE_ECC, IFC_LIST_LEN, NO_BAD_BLOCK,
};
use crate::{ecc, Error, Result};

const VERSION: &str = "1.2.0.0";
const CARD_TYPE: u8 = 2;
/// First indirect FAT cluster; clusters before it hold the superblock.
const FIRST_IFC: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub page_len: u16,
    pub pages_per_cluster: u16,
    pub pages_per_block: u16,
    pub clusters_per_card: u32,
    pub card_flags: u8,
    /// Erase blocks to record as unusable.
    pub bad_blocks: Vec<u32>,
}

impl Default for FormatOptions {
    /// An 8 MB card.
    fn default() -> Self {
        Self {
            page_len: 512,
            pages_per_cluster: 2,
            pages_per_block: 16,
            clusters_per_card: 8192,
            card_flags: CF_USE_ECC | CF_BAD_BLOCK,
            bad_blocks: Vec::new(),
        }
    }
}

impl FormatOptions {
    fn validate(&self) -> Result<()> {
        if !self.page_len.is_power_of_two() || usize::from(self.page_len) % ecc::CHUNK_LEN != 0 {
            return Err(Error::Format(format!("unsupported page length {}", self.page_len)));
        }
        if !self.pages_per_cluster.is_power_of_two()
            || self.pages_per_block == 0
            || self.pages_per_block % self.pages_per_cluster != 0
        {
            return Err(Error::Format(format!(
                "unsupported geometry: {} pages per cluster, {} pages per block",
                self.pages_per_cluster, self.pages_per_block
            )));
        }
        let clusters_per_block = u32::from(self.pages_per_block / self.pages_per_cluster);
        if self.clusters_per_card == 0 || self.clusters_per_card % clusters_per_block != 0 {
            return Err(Error::Format(format!(
                "{} clusters do not fill whole erase blocks",
                self.clusters_per_card
            )));
        }
        if self.bad_blocks.len() > BAD_BLOCK_LIST_LEN {
            return Err(Error::Format(format!(
                "at most {BAD_BLOCK_LIST_LEN} bad blocks can be recorded"
            )));
        }
        Ok(())
    }
}

struct Layout {
    entries_per_cluster: u32,
    ifc_clusters: u32,
    fat_clusters: u32,
}

fn layout(options: &FormatOptions) -> Layout {
    let cluster_size = u32::from(options.page_len) * u32::from(options.pages_per_cluster);
    let entries_per_cluster = cluster_size / 4;
    let fat_clusters = options.clusters_per_card.div_ceil(entries_per_cluster);
    Layout {
        entries_per_cluster,
        ifc_clusters: fat_clusters.div_ceil(entries_per_cluster),
        fat_clusters,
    }
}

pub fn build_superblock(options: &FormatOptions) -> Result<Superblock> {
    options.validate()?;
    let layout = layout(options);
    if layout.ifc_clusters as usize > IFC_LIST_LEN {
        return Err(Error::Format(format!(
            "{} clusters need more than {IFC_LIST_LEN} indirect FAT clusters",
            options.clusters_per_card
        )));
    }

    let clusters_per_block = u32::from(options.pages_per_block / options.pages_per_cluster);
    let alloc_offset = FIRST_IFC + layout.ifc_clusters + layout.fat_clusters;
    // The last two erase blocks are kept back for the backup copies.
    let reserved = alloc_offset + 2 * clusters_per_block;
    if reserved >= options.clusters_per_card {
        return Err(Error::Format(format!(
            "{} clusters is too small for a filesystem",
            options.clusters_per_card
        )));
    }
    let alloc_end = options.clusters_per_card - reserved;
    let total_blocks = options.clusters_per_card / clusters_per_block;

    let mut ifc_list = [0u32; IFC_LIST_LEN];
    for (index, slot) in ifc_list.iter_mut().take(layout.ifc_clusters as usize).enumerate() {
        *slot = FIRST_IFC + index as u32;
    }
    let mut bad_block_list = [NO_BAD_BLOCK; BAD_BLOCK_LIST_LEN];
    bad_block_list[..options.bad_blocks.len()].copy_from_slice(&options.bad_blocks);

    let mut superblock = Superblock {
        version: VERSION.to_string(),
        page_len: options.page_len,
        pages_per_cluster: options.pages_per_cluster,
        pages_per_block: options.pages_per_block,
        clusters_per_card: options.clusters_per_card,
        alloc_offset,
        alloc_end,
        rootdir_cluster: 0,
        backup_block1: total_blocks - 1,
        backup_block2: total_blocks - 2,
        ifc_list,
        bad_block_list,
        card_type: CARD_TYPE,
        card_flags: options.card_flags,
    };
    superblock.rootdir_cluster = (0..alloc_end)
        .find(|&index| !superblock.is_bad_cluster(alloc_offset + index))
        .ok_or_else(|| Error::Format("every allocatable cluster is in a bad block".to_string()))?;
    superblock.validate()?;
    Ok(superblock)
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0u8; words.len() * 4];
    LittleEndian::write_u32_into(words, &mut bytes);
    bytes
}

/// Builds a complete raw image, spare areas included, holding an empty
/// root directory.
pub fn format_image(options: &FormatOptions) -> Result<Vec<u8>> {
    let superblock = build_superblock(options)?;
    let layout = layout(options);
    let raw_page_len = usize::from(superblock.page_len) + superblock.spare_len();
    let erased = superblock.erased_byte();
    let card = ImageCard::with_geometry(
        vec![erased; superblock.total_pages() as usize * raw_page_len],
        raw_page_len,
        u32::from(superblock.pages_per_block),
        erased,
    );
    let io_config = IoConfig {
        verify_writes: false,
        erase_before_write: false,
        spare_len: None,
    };
    let mut io = ClusterIo::new(card, &superblock, &io_config);
    let per_cluster = layout.entries_per_cluster;
    let first_fat = FIRST_IFC + layout.ifc_clusters;

    io.write_cluster(0, &superblock.to_bytes())?;

    for (index, &ifc) in superblock
        .ifc_list
        .iter()
        .take(layout.ifc_clusters as usize)
        .enumerate()
    {
        let words: Vec<u32> = (0..per_cluster)
            .map(|offset| index as u32 * per_cluster + offset)
            .map(|fat| if fat < layout.fat_clusters { first_fat + fat } else { 0 })
            .collect();
        io.write_cluster(ifc, &words_to_bytes(&words))?;
    }

    for fat in 0..layout.fat_clusters {
        let words: Vec<u32> = (0..per_cluster)
            .map(|offset| fat * per_cluster + offset)
            .map(|index| {
                if index == superblock.rootdir_cluster {
                    FAT_END_OF_CHAIN
                } else if index < superblock.alloc_end
                    && superblock.is_bad_cluster(superblock.alloc_offset + index)
                {
                    FAT_BAD
                } else {
                    FAT_FREE
                }
            })
            .collect();
        io.write_cluster(first_fat + fat, &words_to_bytes(&words))?;
    }

    let now = Timestamp::now();
    let mut root = Vec::with_capacity(2 * ENTRY_LEN);
    root.extend_from_slice(&encode_entry(&DirectoryEntry::dot(0, 0, now)));
    root.extend_from_slice(&encode_entry(&DirectoryEntry::dot_dot(now)));
    io.write_cluster(superblock.alloc_offset + superblock.rootdir_cluster, &root)?;

    debug!(
        "formatted {} clusters, {} allocatable from {}",
        superblock.clusters_per_card, superblock.alloc_end, superblock.alloc_offset
    );
    Ok(io.into_device().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::{read_superblock, CF_ERASE_ZEROES};

    #[test]
    fn default_image_is_a_full_raw_8mb_dump() {
        let image = format_image(&FormatOptions::default()).expect("format");
        assert_eq!(image.len(), 16384 * 528);
        assert_eq!(&image[..28], b"Sony PS2 Memory Card Format ");
    }

    #[test]
    fn image_reads_back_its_superblock() {
        let options = FormatOptions::default();
        let mut card = ImageCard::new(format_image(&options).expect("format"));
        let superblock = read_superblock(&mut card, None).expect("superblock");
        assert_eq!(superblock, build_superblock(&options).expect("build"));
        assert_eq!(superblock.ifc_list[0], 8);
        assert_eq!(superblock.ifc_list[1], 0);
        assert_eq!(superblock.backup_block1, 1023);
        assert_eq!(superblock.backup_block2, 1022);
    }

    #[test]
    fn root_skips_leading_bad_blocks() {
        let options = FormatOptions {
            bad_blocks: vec![5],
            ..FormatOptions::default()
        };
        let superblock = build_superblock(&options).expect("build");
        // Block 5 holds absolute clusters 40..48; allocation starts at 41.
        assert_eq!(superblock.rootdir_cluster, 7);
    }

    #[test]
    fn cards_without_ecc_have_no_spare_area() {
        let options = FormatOptions {
            card_flags: CF_ERASE_ZEROES,
            ..FormatOptions::default()
        };
        let image = format_image(&options).expect("format");
        assert_eq!(image.len(), 16384 * 512);
    }

    #[test]
    fn odd_geometry_is_rejected() {
        let options = FormatOptions {
            pages_per_cluster: 3,
            ..FormatOptions::default()
        };
        assert!(matches!(build_superblock(&options), Err(Error::Format(_))));
        let options = FormatOptions {
            bad_blocks: vec![1; 33],
            ..FormatOptions::default()
        };
        assert!(matches!(format_image(&options), Err(Error::Format(_))));
    }
}
