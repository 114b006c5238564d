//! A minimal collective message-passing API.
//!
//! Generalized from gridiron's `message::Communicator` trait, which exposed
//! only `rank`/`size`/`send`/`recv`/`next_time_stamp` and left broadcast and
//! reduction as default methods built on top (per that module's own doc
//! comment). [`CollectiveTransport`] keeps that shape, but sends and
//! receives are addressed by an explicit `(peer_rank, tag)` pair instead of
//! an implicit per-communicator time stamp, since the coupler needs many
//! independent tag spaces in flight at once (one per `(field_id,
//! timestep)`) rather than one.
//!
//! Implementors need only provide `rank`, `size`, `send`, and `recv`; this
//! module supplies `gather`, `broadcast`, and `barrier` atop them.

use crate::error::{CouplerError, Result};

/// Reserved tags for the collective operations built on top of point-to-point
/// send/recv. Field transfer tags are derived from `(field_id, timestep)`
/// and never collide with these (see `crate::coupler::field_tag`).
pub const GATHER_TAG: u32 = u32::MAX;
pub const BROADCAST_TAG: u32 = u32::MAX - 1;
pub const BARRIER_REQUEST_TAG: u32 = u32::MAX - 2;
pub const BARRIER_RELEASE_TAG: u32 = u32::MAX - 3;

/// A handle to a send posted with [`CollectiveTransport::post_send`]. Most
/// backends send eagerly (non-blocking push onto a background thread, as in
/// gridiron's `TcpCommunicator`/`MpiCommunicator`), so the handle carries no
/// state; it exists so callers have something to hand to `wait_all`.
pub struct SendHandle;

/// A pending receive posted with [`CollectiveTransport::post_recv`]. The
/// actual bytes are not fetched until [`CollectiveTransport::wait_all`] (or
/// `recv`) is called: post first, wait later.
pub struct RecvHandle {
    pub src_rank: usize,
    pub tag: u32,
}

/// Thin abstraction over the underlying message-passing substrate: rank
/// identity, size, gather, broadcast, point-to-point send/recv, and barrier
///.
pub trait CollectiveTransport {
    /// This process's rank within the coupled group.
    fn rank(&self) -> usize;

    /// The number of processes in the coupled group.
    fn size(&self) -> usize;

    /// Send `payload` to `dest_rank`, tagged `tag`. Does not block on
    /// delivery; backends are expected to queue the send internally.
    fn send(&self, dest_rank: usize, tag: u32, payload: Vec<u8>) -> Result<()>;

    /// Block until a message from `src_rank` tagged `tag` is available, and
    /// return its payload.
    fn recv(&self, src_rank: usize, tag: u32) -> Result<Vec<u8>>;

    /// Post a non-blocking send. The default implementation just calls
    /// [`Self::send`] eagerly, since the TCP and MPI transports are already
    /// asynchronous under the hood.
    fn post_send(&self, dest_rank: usize, tag: u32, payload: Vec<u8>) -> Result<SendHandle> {
        self.send(dest_rank, tag, payload)?;
        Ok(SendHandle)
    }

    /// Post a non-blocking receive. No bytes are read until `wait_all`.
    fn post_recv(&self, src_rank: usize, tag: u32) -> Result<RecvHandle> {
        Ok(RecvHandle { src_rank, tag })
    }

    /// Wait for every posted send and receive to complete, returning the
    /// received payloads in the order the `RecvHandle`s were given.
    fn wait_all(
        &self,
        sends: Vec<SendHandle>,
        recvs: Vec<RecvHandle>,
    ) -> Result<Vec<Vec<u8>>> {
        drop(sends);
        recvs
            .into_iter()
            .map(|h| self.recv(h.src_rank, h.tag))
            .collect()
    }

    /// Rooted gather: every process sends `payload`; `root` receives all of
    /// them in rank order (`Some`), everyone else gets `None`.
    fn gather(&self, root: usize, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() == root {
            let mut all = Vec::with_capacity(self.size());
            for rank in 0..self.size() {
                if rank == root {
                    all.push(payload.clone());
                } else {
                    all.push(self.recv(rank, GATHER_TAG)?);
                }
            }
            Ok(Some(all))
        } else {
            self.send(root, GATHER_TAG, payload)?;
            Ok(None)
        }
    }

    /// Broadcast: `root` passes `Some(payload)`, everyone else passes
    /// `None`; every process (including `root`) returns the same bytes.
    fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        if self.rank() == root {
            let payload = payload.ok_or_else(|| {
                CouplerError::transport("broadcast root must supply a payload")
            })?;
            for rank in 0..self.size() {
                if rank != root {
                    self.send(rank, BROADCAST_TAG, payload.clone())?;
                }
            }
            Ok(payload)
        } else {
            self.recv(root, BROADCAST_TAG)
        }
    }

    /// Equivalent to a rooted gather+broadcast of an empty payload: every
    /// process blocks until every other process has reached the barrier
    ///.
    fn barrier(&self) -> Result<()> {
        const ROOT: usize = 0;
        if self.rank() == ROOT {
            for rank in 0..self.size() {
                if rank != ROOT {
                    self.recv(rank, BARRIER_REQUEST_TAG)?;
                }
            }
            for rank in 0..self.size() {
                if rank != ROOT {
                    self.send(rank, BARRIER_RELEASE_TAG, Vec::new())?;
                }
            }
        } else {
            self.send(ROOT, BARRIER_REQUEST_TAG, Vec::new())?;
            self.recv(ROOT, BARRIER_RELEASE_TAG)?;
        }
        Ok(())
    }
}
