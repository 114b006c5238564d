//! An in-process collective transport for running multi-rank scenarios in a
//! single test process, without real sockets or MPI.
//!
//! Grounded on the mpsc-channel plumbing gridiron's `thread_pool`/
//! `automaton` modules use to hand work between threads: each rank is just
//! an index into a mailbox shared (via `Arc<Mutex<..>>` plus a `Condvar`)
//! across every `LoopbackTransport` in the same [`LoopbackGroup`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::comm::CollectiveTransport;
use crate::error::Result;

type Mailbox = HashMap<(usize, usize, u32), VecDeque<Vec<u8>>>;

struct Shared {
    mailbox: Mutex<Mailbox>,
    arrived: Condvar,
    size: usize,
}

/// A group of same-process transports that can exchange messages with one
/// another. Create one group per scenario, then one [`LoopbackTransport`]
/// per simulated rank.
pub struct LoopbackGroup {
    shared: Arc<Shared>,
}

impl LoopbackGroup {
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                mailbox: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
                size,
            }),
        }
    }

    pub fn transport(&self, rank: usize) -> LoopbackTransport {
        assert!(rank < self.shared.size, "rank out of range for this group");
        LoopbackTransport {
            rank,
            shared: self.shared.clone(),
        }
    }
}

/// One rank's handle into a [`LoopbackGroup`].
pub struct LoopbackTransport {
    rank: usize,
    shared: Arc<Shared>,
}

impl CollectiveTransport for LoopbackTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn send(&self, dest_rank: usize, tag: u32, payload: Vec<u8>) -> Result<()> {
        let mut mailbox = self.shared.mailbox.lock().unwrap();
        mailbox
            .entry((dest_rank, self.rank, tag))
            .or_insert_with(VecDeque::new)
            .push_back(payload);
        self.shared.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, src_rank: usize, tag: u32) -> Result<Vec<u8>> {
        let mut mailbox = self.shared.mailbox.lock().unwrap();
        loop {
            if let Some(queue) = mailbox.get_mut(&(self.rank, src_rank, tag)) {
                if let Some(message) = queue.pop_front() {
                    return Ok(message);
                }
            }
            mailbox = self.shared.arrived.wait(mailbox).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_delivers_in_fifo_order_per_tag() {
        let group = LoopbackGroup::new(2);
        let a = group.transport(0);
        let b = group.transport(1);

        a.send(1, 7, vec![1]).unwrap();
        a.send(1, 7, vec![2]).unwrap();
        assert_eq!(b.recv(0, 7).unwrap(), vec![1]);
        assert_eq!(b.recv(0, 7).unwrap(), vec![2]);
    }

    #[test]
    fn recv_blocks_until_send_arrives() {
        let group = LoopbackGroup::new(2);
        let a = group.transport(0);
        let b = group.transport(1);

        let handle = thread::spawn(move || b.recv(0, 42).unwrap());
        thread::sleep(std::time::Duration::from_millis(20));
        a.send(1, 42, vec![9, 9]).unwrap();
        assert_eq!(handle.join().unwrap(), vec![9, 9]);
    }

    #[test]
    fn gather_and_broadcast_round_trip() {
        let group = LoopbackGroup::new(3);
        let ranks: Vec<_> = (0..3).map(|r| group.transport(r)).collect();

        let handles: Vec<_> = ranks
            .into_iter()
            .map(|t| {
                thread::spawn(move || {
                    let gathered = t.gather(0, vec![t.rank() as u8]).unwrap();
                    if t.rank() == 0 {
                        assert_eq!(gathered, Some(vec![vec![0], vec![1], vec![2]]));
                    } else {
                        assert_eq!(gathered, None);
                    }
                    let bcast = t.broadcast(0, if t.rank() == 0 { Some(vec![42]) } else { None }).unwrap();
                    assert_eq!(bcast, vec![42]);
                    t.barrier().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
