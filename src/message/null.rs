//! A collective transport that does nothing. Useful for single-rank runs
//! and for exercising plan-build logic without any real peers.

use crate::comm::CollectiveTransport;
use crate::error::{CouplerError, Result};

/// `rank` and `size` report a single-process group; `send`/`recv` always
/// fail with [`CouplerError::Transport`].
pub struct NullTransport;

impl NullTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectiveTransport for NullTransport {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _dest_rank: usize, _tag: u32, _payload: Vec<u8>) -> Result<()> {
        Err(CouplerError::transport("cannot send on a null transport"))
    }

    fn recv(&self, _src_rank: usize, _tag: u32) -> Result<Vec<u8>> {
        Err(CouplerError::transport("cannot recv on a null transport"))
    }
}
