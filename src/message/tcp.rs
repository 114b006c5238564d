//! Provides a collective transport based on TCP sockets.
//!
//! TCP is a connection-oriented protocol, which means that a connection must
//! be established between the sending and receiving ends of the socket in
//! order to read from or write to a stream. Incoming messages carry the
//! sender's rank, needed to implement
//! [`crate::comm::CollectiveTransport::recv`]'s `(src_rank, tag)` addressing
//! rather than identifying a message only by an implicit per-communicator
//! time stamp.

use super::util;
use crate::comm::CollectiveTransport;
use crate::error::{CouplerError, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use std::thread;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_nanos(100);
type SendS = mpsc::Sender<(SocketAddr, Vec<u8>, usize, u32)>;
type SendR = mpsc::Receiver<(SocketAddr, Vec<u8>, usize, u32)>;
type RecvS = mpsc::Sender<(usize, u32, Vec<u8>)>;
type RecvR = mpsc::Receiver<(usize, u32, Vec<u8>)>;

/// Maintains a cache of ingoing and outgoing TCP connections.
///
/// This object facilitates non-blocking sends and blocking receives from any
/// peer. Communicating with a remote peer only opens a new connection on the
/// first call; subsequent communications with that peer reuse the cached
/// connection. It also facilitates receiving a message from any of the open
/// connections. When no message can be read from one of the cached
/// connections, it will try to accept an incoming connection on a short
/// timeout.
pub struct ConnectionPool {
    alive: Arc<AtomicBool>,
    send_s: Option<SendS>,
    recv_r: Option<RecvR>,
    send_thread: Option<thread::JoinHandle<()>>,
    recv_thread: Option<thread::JoinHandle<()>>,
}

impl ConnectionPool {
    fn poll(stream: &mut TcpStream) -> Option<(usize, u32, Vec<u8>)> {
        util::read_usize_non_blocking(stream).map(|rank| {
            let tag = util::read_usize(stream) as u32;
            let len = util::read_usize(stream);
            (rank, tag, util::read_bytes_vec(stream, len))
        })
    }

    /// Creates a `ConnectionPool` from a `TcpListener`. The listener is
    /// placed in a non-blocking accept mode, so the pre-existing blocking
    /// mode is overwritten.
    pub fn from_listener(listener: TcpListener) -> Self {
        let (send_s, send_r): (SendS, SendR) = mpsc::channel();
        let (recv_s, recv_r): (RecvS, RecvR) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let keep_receiving = alive.clone();

        // This thread takes the receiving end of the message sender channel.
        let send_thread = thread::spawn(move || {
            let mut streams = HashMap::new();
            for (address, message, rank, tag) in send_r {
                let stream = streams
                    .entry(address)
                    .or_insert_with(|| TcpStream::connect(address).unwrap());
                stream.write_all(&rank.to_le_bytes()).unwrap();
                stream.write_all(&(tag as usize).to_le_bytes()).unwrap();
                stream.write_all(&message.len().to_le_bytes()).unwrap();
                stream.write_all(&message).unwrap();
            }
        });
        listener.set_nonblocking(true).unwrap();

        // This thread takes the sending end of the message receiving channel.
        let recv_thread = thread::spawn(move || {
            let mut streams = Vec::new();
            while keep_receiving.load(Ordering::Relaxed) {
                for stream in &mut streams {
                    if let Some((rank, tag, message)) = Self::poll(stream) {
                        recv_s.send((rank, tag, message)).unwrap();
                    }
                }
                if let Ok((stream, _)) = listener.accept() {
                    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
                    streams.push(stream)
                }
            }
        });

        Self {
            alive,
            send_s: Some(send_s),
            recv_r: Some(recv_r),
            send_thread: Some(send_thread),
            recv_thread: Some(recv_thread),
        }
    }

    /// Initiates a blocking receive from any peer.
    pub fn recv(&mut self) -> (usize, u32, Vec<u8>) {
        self.recv_r.as_ref().unwrap().recv().unwrap()
    }

    /// Initiates a non-blocking send to a particular peer.
    pub fn send(&mut self, peer: SocketAddr, message: Vec<u8>, rank: usize, tag: u32) {
        self.send_s
            .as_ref()
            .unwrap()
            .send((peer, message, rank, tag))
            .unwrap()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.alive.swap(false, Ordering::Relaxed);
        self.send_s.take().unwrap();
        self.send_thread.take().unwrap().join().unwrap();
        self.recv_thread.take().unwrap().join().unwrap();
    }
}

pub struct TcpTransport {
    rank: usize,
    peers: Vec<SocketAddr>,
    connections: RefCell<ConnectionPool>,
    undelivered: RefCell<Vec<(usize, u32, Vec<u8>)>>,
}

impl TcpTransport {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> Result<Self> {
        let listener = TcpListener::bind(peers[rank])
            .map_err(|e| CouplerError::transport(format!("bind failed: {e}")))?;
        let connections = RefCell::new(ConnectionPool::from_listener(listener));
        Ok(Self {
            rank,
            peers,
            connections,
            undelivered: RefCell::new(Vec::new()),
        })
    }
}

impl CollectiveTransport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest_rank: usize, tag: u32, payload: Vec<u8>) -> Result<()> {
        self.connections
            .borrow_mut()
            .send(self.peers[dest_rank], payload, self.rank, tag);
        Ok(())
    }

    fn recv(&self, src_rank: usize, tag: u32) -> Result<Vec<u8>> {
        let mut connections = self.connections.borrow_mut();
        let mut undelivered = self.undelivered.borrow_mut();
        match undelivered
            .iter()
            .position(|(rank, t, _)| *rank == src_rank && *t == tag)
        {
            Some(index) => Ok(undelivered.remove(index).2),
            None => loop {
                let (rank, t, message) = connections.recv();
                if rank == src_rank && t == tag {
                    return Ok(message);
                } else {
                    undelivered.push((rank, t, message))
                }
            },
        }
    }
}
