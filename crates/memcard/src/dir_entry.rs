//! Directory records.
//!
//! A directory is a cluster chain holding 512-byte records. The first two
//! records are always `.` and `..`; the `.` record's length is the number
//! of records in use.

use std::borrow::Cow;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::{Error, Result};

pub const ENTRY_LEN: usize = 512;
pub const NAME_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = NAME_LEN - 1;

/// Cluster value of a file that owns no clusters yet.
pub const NO_CLUSTER: u32 = 0xFFFF_FFFF;

const ERASED_MODES: [u16; 2] = [0xFFFF, 0x7F7F];

pub mod mode {
    pub const READ: u16 = 0x0001;
    pub const WRITE: u16 = 0x0002;
    pub const EXECUTE: u16 = 0x0004;
    pub const PROTECTED: u16 = 0x0008;
    pub const FILE: u16 = 0x0010;
    pub const DIRECTORY: u16 = 0x0020;
    pub const CREATED: u16 = 0x0400;
    pub const POCKETSTATION: u16 = 0x0800;
    pub const PSX: u16 = 0x1000;
    pub const HIDDEN: u16 = 0x2000;
    pub const EXISTS: u16 = 0x8000;

    pub const NEW_FILE: u16 = EXISTS | CREATED | FILE | EXECUTE | WRITE | READ;
    pub const NEW_DIRECTORY: u16 = EXISTS | CREATED | DIRECTORY | EXECUTE | WRITE | READ;
    pub const DOT_DOT: u16 = EXISTS | HIDDEN | CREATED | DIRECTORY | EXECUTE | WRITE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Unused,
    Deleted,
}

/// Packed on-card time: `[0][sec][min][hour][day][month][year lo][year hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl Timestamp {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            second: bytes[1],
            minute: bytes[2],
            hour: bytes[3],
            day: bytes[4],
            month: bytes[5],
            year: LittleEndian::read_u16(&bytes[6..8]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[1] = self.second;
        bytes[2] = self.minute;
        bytes[3] = self.hour;
        bytes[4] = self.day;
        bytes[5] = self.month;
        LittleEndian::write_u16(&mut bytes[6..8], self.year);
        bytes
    }

    pub fn to_datetime(&self) -> Result<NaiveDateTime> {
        if self.year == 0 {
            return Err(Error::Format(format!("timestamp year 0 in {self:?}")));
        }
        let date = NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::from(self.month),
            u32::from(self.day),
        )
        .ok_or_else(|| Error::Format(format!("timestamp date out of range in {self:?}")))?;
        let time = NaiveTime::from_hms_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
        )
        .ok_or_else(|| Error::Format(format!("timestamp time out of range in {self:?}")))?;
        Ok(NaiveDateTime::new(date, time))
    }

    pub fn from_datetime(value: &NaiveDateTime) -> Result<Self> {
        let year = u16::try_from(value.year())
            .ok()
            .filter(|&year| year != 0)
            .ok_or_else(|| Error::Format(format!("year {} cannot be stored", value.year())))?;
        Ok(Self {
            second: value.second().min(59) as u8,
            minute: value.minute() as u8,
            hour: value.hour() as u8,
            day: value.day() as u8,
            month: value.month() as u8,
            year,
        })
    }

    pub fn now() -> Self {
        let now = Local::now().naive_local();
        Self {
            second: now.second().min(59) as u8,
            minute: now.minute() as u8,
            hour: now.hour() as u8,
            day: now.day() as u8,
            month: now.month() as u8,
            year: now.year().clamp(1, i32::from(u16::MAX)) as u16,
        }
    }
}

pub fn parse_timestamp(bytes: &[u8]) -> Result<NaiveDateTime> {
    Timestamp::from_bytes(bytes).to_datetime()
}

pub fn format_timestamp(value: &NaiveDateTime) -> Result<[u8; 8]> {
    Ok(Timestamp::from_datetime(value)?.to_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    /// Name bytes as stored on the card, without the NUL padding. Names
    /// are not required to be UTF-8 and are written back unchanged.
    pub name: Vec<u8>,
    pub mode: u16,
    /// Byte length; always 0 for directories.
    pub size: u32,
    /// Records in use; directories only.
    pub entry_count: u32,
    /// First cluster, relative to the allocation offset.
    pub cluster: u32,
    /// For a `.` record, this directory's slot in its parent.
    pub parent_slot: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub attributes: u32,
}

impl DirectoryEntry {
    pub fn new_file(name: &str, now: Timestamp) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            mode: mode::NEW_FILE,
            cluster: NO_CLUSTER,
            created: now,
            modified: now,
            ..Self::default()
        }
    }

    pub fn new_directory(name: &str, cluster: u32, now: Timestamp) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            mode: mode::NEW_DIRECTORY,
            entry_count: 2,
            cluster,
            created: now,
            modified: now,
            ..Self::default()
        }
    }

    /// The `.` record: points back at the parent directory.
    pub fn dot(parent_cluster: u32, parent_slot: u32, now: Timestamp) -> Self {
        Self {
            parent_slot,
            ..Self::new_directory(".", parent_cluster, now)
        }
    }

    pub fn dot_dot(now: Timestamp) -> Self {
        Self {
            name: b"..".to_vec(),
            mode: mode::DOT_DOT,
            created: now,
            modified: now,
            ..Self::default()
        }
    }

    /// The name for display; bytes that are not UTF-8 become U+FFFD.
    pub fn display_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Whether a path component names this entry, either byte for byte or
    /// through its display form.
    pub fn has_name(&self, name: &str) -> bool {
        self.name == name.as_bytes() || self.display_name() == name
    }

    pub fn kind(&self) -> EntryKind {
        if self.mode == 0 {
            EntryKind::Unused
        } else if self.mode & mode::EXISTS == 0 {
            EntryKind::Deleted
        } else if self.mode & mode::DIRECTORY != 0 {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind() == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Directory
    }

    /// `.` and `..` bookkeeping records.
    pub fn is_pseudo(&self) -> bool {
        self.name == b"." || self.name == b".."
    }

    /// A live file or directory other than `.`/`..`.
    pub fn is_visible(&self) -> bool {
        matches!(self.kind(), EntryKind::File | EntryKind::Directory) && !self.is_pseudo()
    }

    pub fn is_hidden(&self) -> bool {
        self.mode & mode::HIDDEN != 0
    }

    pub fn start_cluster(&self) -> Option<u32> {
        match self.kind() {
            EntryKind::File | EntryKind::Directory if self.cluster != NO_CLUSTER => {
                Some(self.cluster)
            }
            _ => None,
        }
    }

    pub fn mark_deleted(&mut self) {
        self.mode &= !mode::EXISTS;
    }
}

pub fn decode_entry(record: &[u8]) -> DirectoryEntry {
    let mode = LittleEndian::read_u16(&record[0x00..]);
    let length = LittleEndian::read_u32(&record[0x04..]);
    let (size, entry_count) = if mode & mode::DIRECTORY != 0 {
        (0, length)
    } else {
        (length, 0)
    };
    let name = &record[0x40..0x40 + NAME_LEN];
    let name_end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);

    DirectoryEntry {
        name: name[..name_end].to_vec(),
        mode,
        size,
        entry_count,
        cluster: LittleEndian::read_u32(&record[0x10..]),
        parent_slot: LittleEndian::read_u32(&record[0x14..]),
        created: Timestamp::from_bytes(&record[0x08..0x10]),
        modified: Timestamp::from_bytes(&record[0x18..0x20]),
        attributes: LittleEndian::read_u32(&record[0x20..]),
    }
}

pub fn encode_entry(entry: &DirectoryEntry) -> [u8; ENTRY_LEN] {
    let mut record = [0u8; ENTRY_LEN];
    let length = if entry.mode & mode::DIRECTORY != 0 {
        entry.entry_count
    } else {
        entry.size
    };
    LittleEndian::write_u16(&mut record[0x00..], entry.mode);
    LittleEndian::write_u32(&mut record[0x04..], length);
    record[0x08..0x10].copy_from_slice(&entry.created.to_bytes());
    LittleEndian::write_u32(&mut record[0x10..], entry.cluster);
    LittleEndian::write_u32(&mut record[0x14..], entry.parent_slot);
    record[0x18..0x20].copy_from_slice(&entry.modified.to_bytes());
    LittleEndian::write_u32(&mut record[0x20..], entry.attributes);
    let name = &entry.name;
    let name_len = name.len().min(MAX_NAME_LEN);
    record[0x40..0x40 + name_len].copy_from_slice(&name[..name_len]);
    record
}

/// Decodes the records of a directory chain, keeping unused and deleted
/// slots so indices stay stable. Stops at the count declared by a leading
/// `.` record, at an erased record, or at the end of `bytes`.
pub fn decode_entries(bytes: &[u8]) -> Vec<DirectoryEntry> {
    let mut entries = Vec::new();
    let mut declared = None;
    for record in bytes.chunks_exact(ENTRY_LEN) {
        if declared.is_some_and(|count| entries.len() >= count) {
            break;
        }
        if ERASED_MODES.contains(&LittleEndian::read_u16(record)) {
            break;
        }
        let entry = decode_entry(record);
        if entries.is_empty() && entry.name == b"." && entry.is_dir() {
            declared = Some(entry.entry_count as usize);
        }
        entries.push(entry);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> Timestamp {
        Timestamp {
            second: 5,
            minute: 4,
            hour: 3,
            day: 2,
            month: 1,
            year: 2024,
        }
    }

    fn samples() -> Vec<DirectoryEntry> {
        let mut file = DirectoryEntry::new_file("BASLUS-20000SAVE", stamp());
        file.size = 1234;
        file.cluster = 17;
        let mut deleted = file.clone();
        deleted.mark_deleted();
        vec![
            file,
            deleted,
            DirectoryEntry::new_directory("BESLES-12345", 9, stamp()),
            DirectoryEntry::dot(0, 3, stamp()),
            DirectoryEntry::dot_dot(stamp()),
            DirectoryEntry::default(),
            DirectoryEntry::new_file(&"N".repeat(MAX_NAME_LEN), stamp()),
        ]
    }

    #[test]
    fn decode_inverts_encode() {
        for entry in samples() {
            assert_eq!(decode_entries(&encode_entry(&entry)), vec![entry.clone()]);
        }
    }

    #[test]
    fn kinds_follow_mode_bits() {
        let kinds: Vec<_> = samples().iter().map(DirectoryEntry::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::File,
                EntryKind::Deleted,
                EntryKind::Directory,
                EntryKind::Directory,
                EntryKind::Directory,
                EntryKind::Unused,
                EntryKind::File,
            ]
        );
    }

    #[test]
    fn record_layout_matches_the_card() {
        let mut entry = DirectoryEntry::new_file("A", stamp());
        entry.size = 0x0102_0304;
        entry.cluster = 7;
        let record = encode_entry(&entry);
        assert_eq!(&record[0..2], &[0x17, 0x84]);
        assert_eq!(&record[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&record[8..16], &[0, 5, 4, 3, 2, 1, 0xE8, 0x07]);
        assert_eq!(&record[16..20], &[7, 0, 0, 0]);
        assert_eq!(record[0x40], b'A');
        assert_eq!(record[0x41], 0);
    }

    #[test]
    fn names_that_are_not_utf8_survive_a_rewrite() {
        let mut record = encode_entry(&DirectoryEntry::new_file("X", stamp()));
        record[0x40..0x43].copy_from_slice(&[0x82, 0xA0, 0x00]);
        let entry = decode_entry(&record);
        assert_eq!(entry.name, [0x82, 0xA0]);
        assert_eq!(entry.display_name(), "\u{FFFD}\u{FFFD}");
        assert!(entry.has_name("\u{FFFD}\u{FFFD}"));
        assert_eq!(encode_entry(&entry), record);
    }

    #[test]
    fn dot_count_limits_decoding() {
        let mut bytes = Vec::new();
        let mut dot = DirectoryEntry::dot(0, 0, stamp());
        dot.entry_count = 3;
        bytes.extend_from_slice(&encode_entry(&dot));
        bytes.extend_from_slice(&encode_entry(&DirectoryEntry::dot_dot(stamp())));
        bytes.extend_from_slice(&encode_entry(&DirectoryEntry::default()));
        bytes.extend_from_slice(&encode_entry(&DirectoryEntry::new_file("STALE", stamp())));
        let entries = decode_entries(&bytes);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].kind(), EntryKind::Unused);
    }

    #[test]
    fn erased_record_ends_the_directory() {
        let mut bytes = encode_entry(&DirectoryEntry::new_file("ONE", stamp())).to_vec();
        bytes.extend_from_slice(&[0xFF; ENTRY_LEN]);
        bytes.extend_from_slice(&encode_entry(&DirectoryEntry::new_file("TWO", stamp())));
        assert_eq!(decode_entries(&bytes).len(), 1);
    }

    #[test]
    fn deleted_and_empty_entries_have_no_start_cluster() {
        let mut entry = DirectoryEntry::new_file("F", stamp());
        assert_eq!(entry.start_cluster(), None);
        entry.cluster = 4;
        assert_eq!(entry.start_cluster(), Some(4));
        entry.mark_deleted();
        assert_eq!(entry.start_cluster(), None);
        assert_eq!(entry.cluster, 4);
    }

    #[test]
    fn timestamps_convert_to_calendar_time() {
        let parsed = parse_timestamp(&stamp().to_bytes()).expect("parse");
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(format_timestamp(&expected).expect("format"), stamp().to_bytes());
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        let cases = [
            Timestamp { month: 13, ..stamp() },
            Timestamp { month: 0, ..stamp() },
            Timestamp { day: 30, month: 2, ..stamp() },
            Timestamp { hour: 24, ..stamp() },
            Timestamp { minute: 60, ..stamp() },
            Timestamp { second: 60, ..stamp() },
            Timestamp { year: 0, ..stamp() },
        ];
        for case in cases {
            assert!(
                matches!(parse_timestamp(&case.to_bytes()), Err(Error::Format(_))),
                "{case:?} should be rejected"
            );
        }
    }

    #[test]
    fn years_outside_the_field_are_rejected() {
        let too_late = NaiveDate::from_ymd_opt(70000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(matches!(format_timestamp(&too_late), Err(Error::Format(_))));
    }
}
