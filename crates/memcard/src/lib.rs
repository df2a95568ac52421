//! Driver for the PS2 memory-card filesystem.
//!
//! A [`Session`] sits on top of a page-granular [`BlockAdapter`] and exposes
//! the card's directory tree: listing, reading and writing files, creating
//! and removing directories. Mutating calls require the card to have been
//! authenticated through its [`AuthPort`] first.
//!
//! [`ImageCard`] serves a raw dump file through both seams, which is what
//! the `memcard` command and the tests drive.

pub mod auth;
pub mod check;
pub mod cluster;
pub mod config;
pub mod device;
pub mod dir_entry;
pub mod ecc;
mod error;
mod facade;
pub mod fat;
pub mod format;
pub mod handle;
pub mod image;
pub mod path;
pub mod session;
pub mod shared;
pub mod superblock;

pub use auth::{AuthKeys, AuthSession, AuthState};
pub use check::{CheckReport, Problem};
pub use config::{Config, CONFIG_FILE_NAME};
pub use device::{AuthPort, AuthRequest, BlockAdapter};
pub use dir_entry::{DirectoryEntry, EntryKind, Timestamp};
pub use error::{Error, Result};
pub use format::{format_image, FormatOptions};
pub use handle::{HandleId, OpenMode};
pub use image::ImageCard;
pub use path::{Location, Resolved};
pub use session::{CardInfo, Session};
pub use shared::SharedSession;
pub use superblock::Superblock;
