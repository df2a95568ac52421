//! Seams to the bridging adapter.
//!
//! The physical transport (USB framing, command packets, timeouts) lives
//! outside this crate. Everything above talks to the card through these two
//! traits, one page or one authentication exchange at a time.

use crate::Result;

/// Page-granular access to the card.
///
/// Raw pages are `page_len + spare_len` bytes: data followed by the spare
/// area carrying the ECC. Each call either fully succeeds or reports an
/// error; nothing is assumed about atomicity across calls.
pub trait BlockAdapter {
    fn read_page(&mut self, page: u32) -> Result<Vec<u8>>;

    fn write_page(&mut self, page: u32, raw: &[u8]) -> Result<()>;

    fn erase_block(&mut self, block: u32) -> Result<()>;
}

/// One request of the card's authentication command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequest {
    /// Opens an authentication exchange.
    Authorize,
    /// A sub-command without payload.
    Step(u8),
    /// A sub-command returning an 8-byte block.
    Get(u8),
    /// A sub-command carrying an 8-byte block.
    Put(u8, [u8; 8]),
    /// Re-arms the card's read path after an exchange.
    Sentinel,
}

pub trait AuthPort {
    /// Performs one exchange. `Get` requests answer `Some(block)`, every
    /// other request answers `None`.
    fn exchange(&mut self, request: AuthRequest) -> Result<Option<[u8; 8]>>;
}

impl<T: BlockAdapter + ?Sized> BlockAdapter for &mut T {
    fn read_page(&mut self, page: u32) -> Result<Vec<u8>> {
        (**self).read_page(page)
    }

    fn write_page(&mut self, page: u32, raw: &[u8]) -> Result<()> {
        (**self).write_page(page, raw)
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        (**self).erase_block(block)
    }
}

impl<T: AuthPort + ?Sized> AuthPort for &mut T {
    fn exchange(&mut self, request: AuthRequest) -> Result<Option<[u8; 8]>> {
        (**self).exchange(request)
    }
}
