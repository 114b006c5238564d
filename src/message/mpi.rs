//! Collective transport backed by MPI, via the `src/mpi/mpi.c` shim.
//!
//! Sends are funneled through a background thread so `send` never blocks
//! the caller, and `recv` probes for the specific `(src_rank, tag)` pair
//! before reading into a freshly sized buffer.
#![cfg(feature = "mpi")]
use crate::comm::CollectiveTransport;
use crate::error::{CouplerError, Result};
use crate::mpi;
use std::sync::mpsc;
use std::thread;

type Sender = mpsc::Sender<(usize, u32, Vec<u8>)>;
type Receiver = mpsc::Receiver<(usize, u32, Vec<u8>)>;

pub struct MpiTransport {
    send_sink: Option<Sender>,
    send_thread: Option<thread::JoinHandle<()>>,
}

impl MpiTransport {
    pub fn new() -> Self {
        let (send_sink, recv_sink): (Sender, Receiver) = mpsc::channel();
        let send_thread = thread::spawn(move || {
            for (rank, tag, message) in recv_sink {
                unsafe {
                    mpi::send(message.as_ptr(), message.len() as i32, rank as i32, tag as i32);
                }
            }
        });
        Self {
            send_sink: Some(send_sink),
            send_thread: Some(send_thread),
        }
    }
}

impl Default for MpiTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectiveTransport for MpiTransport {
    fn rank(&self) -> usize {
        unsafe { mpi::comm_rank() as usize }
    }

    fn size(&self) -> usize {
        unsafe { mpi::comm_size() as usize }
    }

    fn send(&self, dest_rank: usize, tag: u32, payload: Vec<u8>) -> Result<()> {
        self.send_sink
            .as_ref()
            .unwrap()
            .send((dest_rank, tag, payload))
            .map_err(|_| CouplerError::transport("mpi send thread has shut down"))
    }

    fn recv(&self, src_rank: usize, tag: u32) -> Result<Vec<u8>> {
        unsafe {
            let status = mpi::probe(src_rank as i32, tag as i32);
            let mut buffer = vec![0; status.count as usize];
            mpi::recv(buffer.as_mut_ptr(), status.count, status.source, status.tag);
            Ok(buffer)
        }
    }
}

impl Drop for MpiTransport {
    fn drop(&mut self) {
        self.send_sink.take().unwrap();
        self.send_thread.take().unwrap().join().unwrap();
    }
}
