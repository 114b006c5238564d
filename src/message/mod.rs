//! Transport backends implementing [`crate::comm::CollectiveTransport`].
//!
//! Implementors only need to write `send` and `recv`; [`crate::comm`]
//! supplies gather, broadcast, and barrier on top (see that module's doc
//! comment).

mod loopback;
#[cfg(feature = "mpi")]
mod mpi;
mod null;
mod tcp;
mod util;

pub use loopback::{LoopbackGroup, LoopbackTransport};
pub use null::NullTransport;
pub use tcp::TcpTransport;

#[cfg(feature = "mpi")]
pub use mpi::MpiTransport;
