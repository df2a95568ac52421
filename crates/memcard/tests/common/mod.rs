#![allow(dead_code)]

use memcard::{
    format_image, AuthKeys, AuthPort, AuthRequest, BlockAdapter, Config, FormatOptions, ImageCard,
    Session,
};

pub const RAW_PAGE_LEN: usize = 528;

pub fn keys() -> AuthKeys {
    AuthKeys {
        key_left: *b"left-key-0123456",
        iv_left: *b"left-iv0",
        key_right: *b"right-key-654321",
        iv_right: *b"right-iv",
        challenge_iv: *b"chall-iv",
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.auth.set_keys(&keys());
    config
}

pub fn fresh_card() -> ImageCard {
    ImageCard::new(format_image(&FormatOptions::default()).expect("format image"))
        .with_keys(keys())
        .require_auth(true)
}

/// A 512-cluster card, for tests that fill it up.
pub fn small_card() -> ImageCard {
    let options = FormatOptions {
        clusters_per_card: 512,
        ..FormatOptions::default()
    };
    ImageCard::new(format_image(&options).expect("format image"))
        .with_keys(keys())
        .require_auth(true)
}

pub fn open(card: ImageCard) -> Session<ImageCard> {
    Session::open(card, &config()).expect("open session")
}

pub fn authenticated(card: ImageCard) -> Session<ImageCard> {
    let mut session = open(card);
    session.authenticate().expect("authenticate");
    session
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// First raw page of the file at `path`.
pub fn first_page<D: BlockAdapter>(session: &mut Session<D>, path: &str) -> u32 {
    let resolved = session.resolve(path).expect("resolve");
    let superblock = session.superblock();
    (superblock.alloc_offset + resolved.entry.cluster) * u32::from(superblock.pages_per_cluster)
}

/// Counts the transport calls that change the card.
pub struct CountingCard {
    pub inner: ImageCard,
    pub writes: usize,
    pub erases: usize,
}

impl CountingCard {
    pub fn new(inner: ImageCard) -> Self {
        Self {
            inner,
            writes: 0,
            erases: 0,
        }
    }
}

impl BlockAdapter for CountingCard {
    fn read_page(&mut self, page: u32) -> memcard::Result<Vec<u8>> {
        self.inner.read_page(page)
    }

    fn write_page(&mut self, page: u32, raw: &[u8]) -> memcard::Result<()> {
        self.writes += 1;
        self.inner.write_page(page, raw)
    }

    fn erase_block(&mut self, block: u32) -> memcard::Result<()> {
        self.erases += 1;
        self.inner.erase_block(block)
    }
}

impl AuthPort for CountingCard {
    fn exchange(&mut self, request: AuthRequest) -> memcard::Result<Option<[u8; 8]>> {
        self.inner.exchange(request)
    }
}

/// Fails every write after the first `allowed` ones.
pub struct FailingCard {
    pub inner: ImageCard,
    pub allowed: usize,
}

impl BlockAdapter for FailingCard {
    fn read_page(&mut self, page: u32) -> memcard::Result<Vec<u8>> {
        self.inner.read_page(page)
    }

    fn write_page(&mut self, page: u32, raw: &[u8]) -> memcard::Result<()> {
        if self.allowed == 0 {
            return Err(memcard::Error::Media {
                page: Some(page),
                reason: "write timed out".to_string(),
            });
        }
        self.allowed -= 1;
        self.inner.write_page(page, raw)
    }

    fn erase_block(&mut self, block: u32) -> memcard::Result<()> {
        self.inner.erase_block(block)
    }
}

impl AuthPort for FailingCard {
    fn exchange(&mut self, request: AuthRequest) -> memcard::Result<Option<[u8; 8]>> {
        self.inner.exchange(request)
    }
}
