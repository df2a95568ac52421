//! A card held in memory as a raw page dump.
//!
//! `ImageCard` answers both adapter seams: pages come from the dump (data
//! and spare area for each page, in page order) and the authentication
//! requests are answered the way a genuine card does, using the same
//! pre-shared keys as the host.

use std::path::Path;

use log::{debug, trace};

use crate::auth::{self, step, AuthKeys, Block, TEST_BLOCK};
use crate::device::{AuthPort, AuthRequest, BlockAdapter};
use crate::superblock::Superblock;
use crate::{Error, Result};

pub const STANDARD_RAW_PAGE_LEN: usize = 512 + 16;
pub const STANDARD_PAGES_PER_BLOCK: u32 = 16;

#[derive(Default)]
struct CardAuth {
    vector: Block,
    plain: Block,
    nonce: Block,
    auth_key: [u8; 16],
    challenge: [Block; 3],
    responses: [Block; 3],
    verified: bool,
    authenticated: bool,
}

pub struct ImageCard {
    data: Vec<u8>,
    raw_page_len: usize,
    pages_per_block: u32,
    erased: u8,
    keys: Option<AuthKeys>,
    require_auth: bool,
    auth: CardAuth,
}

impl ImageCard {
    /// Wraps a dump, taking the page geometry from its superblock when it
    /// has one and assuming a standard 8 MB card otherwise.
    pub fn new(data: Vec<u8>) -> Self {
        match Superblock::parse(&data) {
            Ok(superblock) => {
                let raw_page_len = usize::from(superblock.page_len) + superblock.spare_len();
                let pages_per_block = u32::from(superblock.pages_per_block);
                let erased = superblock.erased_byte();
                Self::with_geometry(data, raw_page_len, pages_per_block, erased)
            }
            Err(_) => Self::with_geometry(
                data,
                STANDARD_RAW_PAGE_LEN,
                STANDARD_PAGES_PER_BLOCK,
                0xFF,
            ),
        }
    }

    pub fn with_geometry(data: Vec<u8>, raw_page_len: usize, pages_per_block: u32, erased: u8) -> Self {
        Self {
            data,
            raw_page_len,
            pages_per_block,
            erased,
            keys: None,
            require_auth: false,
            auth: CardAuth::default(),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// Lets the card answer the authentication handshake.
    pub fn with_keys(mut self, keys: AuthKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Rejects writes and erases until a handshake has succeeded.
    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.authenticated
    }

    pub fn page_count(&self) -> u32 {
        (self.data.len() / self.raw_page_len) as u32
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn page_range(&self, page: u32) -> Result<std::ops::Range<usize>> {
        let start = page as usize * self.raw_page_len;
        let end = start + self.raw_page_len;
        if end > self.data.len() {
            return Err(Error::media(page, "beyond the end of the image"));
        }
        Ok(start..end)
    }

    fn check_writable(&self) -> Result<()> {
        if self.require_auth && !self.auth.authenticated {
            return Err(Error::AuthRequired);
        }
        Ok(())
    }

    fn unexpected(request: AuthRequest) -> Error {
        Error::Media {
            page: None,
            reason: format!("card rejected authentication request {request:?}"),
        }
    }

    /// Checks the host's challenge and prepares the three responses. A
    /// challenge that does not verify gets random responses.
    fn answer_challenge(&mut self, keys: &AuthKeys) {
        let state = &mut self.auth;
        let [c1, c2, c3] = state.challenge;
        state.verified = auth::decrypt(&state.auth_key, &keys.challenge_iv, &c3) == TEST_BLOCK
            && auth::decrypt(&state.auth_key, &c3, &c2) == state.nonce
            && auth::decrypt(&state.auth_key, &c2, &c1) == state.vector;
        state.responses = if state.verified {
            let session_key: Block = rand::random();
            let r1 = auth::encrypt(&state.auth_key, &keys.challenge_iv, &state.nonce);
            let r2 = auth::encrypt(&state.auth_key, &r1, &TEST_BLOCK);
            let r3 = auth::encrypt(&state.auth_key, &r2, &session_key);
            [r1, r2, r3]
        } else {
            debug!("image card: host challenge did not verify");
            rand::random()
        };
    }
}

impl BlockAdapter for ImageCard {
    fn read_page(&mut self, page: u32) -> Result<Vec<u8>> {
        let range = self.page_range(page)?;
        Ok(self.data[range].to_vec())
    }

    fn write_page(&mut self, page: u32, raw: &[u8]) -> Result<()> {
        self.check_writable()?;
        let range = self.page_range(page)?;
        let len = raw.len().min(range.len());
        self.data[range.start..range.start + len].copy_from_slice(&raw[..len]);
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.check_writable()?;
        let first = block * self.pages_per_block;
        let start = self.page_range(first)?.start;
        let end = self.page_range(first + self.pages_per_block - 1)?.end;
        self.data[start..end].fill(self.erased);
        Ok(())
    }
}

impl AuthPort for ImageCard {
    fn exchange(&mut self, request: AuthRequest) -> Result<Option<Block>> {
        let keys = self.keys.clone().ok_or_else(|| Error::Media {
            page: None,
            reason: "card does not answer authentication requests".to_string(),
        })?;
        trace!("image card: {request:?}");

        match request {
            AuthRequest::Authorize => {
                let vector: Block = rand::random();
                let plain: Block = rand::random();
                self.auth = CardAuth {
                    vector,
                    plain,
                    auth_key: auth::derive_auth_key(&keys, &vector, &plain),
                    ..CardAuth::default()
                };
                Ok(None)
            }
            AuthRequest::Step(step::NONCE_READY) => {
                self.auth.nonce = rand::random();
                Ok(None)
            }
            AuthRequest::Step(step::FINISH) => {
                self.auth.authenticated = self.auth.verified;
                Ok(None)
            }
            AuthRequest::Step(_) | AuthRequest::Sentinel => Ok(None),
            AuthRequest::Get(step::GET_VECTOR) => Ok(Some(self.auth.vector)),
            AuthRequest::Get(step::GET_PLAIN) => Ok(Some(self.auth.plain)),
            AuthRequest::Get(step::GET_NONCE) => Ok(Some(self.auth.nonce)),
            AuthRequest::Get(step::GET_R1) => Ok(Some(self.auth.responses[0])),
            AuthRequest::Get(step::GET_R2) => Ok(Some(self.auth.responses[1])),
            AuthRequest::Get(step::GET_R3) => Ok(Some(self.auth.responses[2])),
            AuthRequest::Put(step::PUT_C1, block) => {
                self.auth.challenge[0] = block;
                Ok(None)
            }
            AuthRequest::Put(step::PUT_C2, block) => {
                self.auth.challenge[1] = block;
                Ok(None)
            }
            AuthRequest::Put(step::PUT_C3, block) => {
                self.auth.challenge[2] = block;
                self.answer_challenge(&keys);
                Ok(None)
            }
            request => Err(Self::unexpected(request)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_image, FormatOptions};

    #[test]
    fn geometry_comes_from_the_superblock() {
        let card = ImageCard::new(format_image(&FormatOptions::default()).expect("format"));
        assert_eq!(card.page_count(), 16384);
    }

    #[test]
    fn pages_past_the_end_are_media_errors() {
        let mut card = ImageCard::new(vec![0xFF; STANDARD_RAW_PAGE_LEN * 16]);
        assert!(card.read_page(15).is_ok());
        assert!(matches!(card.read_page(16), Err(Error::Media { page: Some(16), .. })));
    }

    #[test]
    fn erase_fills_the_whole_block() {
        let mut card = ImageCard::new(vec![0u8; STANDARD_RAW_PAGE_LEN * 32]);
        card.erase_block(1).expect("erase");
        let bytes = card.as_bytes();
        let block = STANDARD_RAW_PAGE_LEN * 16;
        assert!(bytes[..block].iter().all(|&b| b == 0));
        assert!(bytes[block..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn protected_card_rejects_writes_until_authenticated() {
        let mut card = ImageCard::new(vec![0xFF; STANDARD_RAW_PAGE_LEN * 16]).require_auth(true);
        assert!(matches!(card.write_page(0, &[0u8; 4]), Err(Error::AuthRequired)));
        assert!(matches!(card.erase_block(0), Err(Error::AuthRequired)));
    }

    #[test]
    fn card_without_keys_does_not_answer() {
        let mut card = ImageCard::new(Vec::new());
        assert!(matches!(
            card.exchange(AuthRequest::Authorize),
            Err(Error::Media { page: None, .. })
        ));
    }
}
