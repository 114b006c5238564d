//! A coupler runtime for exchanging gridded fields between independently
//! running parallel simulation components.
//!
//! Each component (an atmosphere model, an ocean model, a sea-ice model, ...)
//! partitions a logically rectangular 2-D grid across many processes. This
//! crate computes, without a central coordinator, a per-process routing plan
//! from precomputed remapping weights and the other participants' local
//! subdomains, then uses that plan to drive per-timestep `begin/put/get/end`
//! transfer windows.
//!
//! The [`coupler::Coupler`] type is the thin façade a model driver talks to.
//! Everything else in this crate is the machinery it is built from:
//! [`grid`] (local identity), [`peer`] (who else is out there),
//! [`weight`] (the sparse remapping matrix), [`route`] and [`plan`] (turning
//! those into a routing plan), [`transfer`] (executing it), and [`comm`] /
//! [`message`] (the transport it rides on).

pub mod comm;
pub mod config;
pub mod coupler;
pub mod error;
pub mod grid;
pub mod message;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod peer;
pub mod plan;
pub mod route;
pub mod transfer;
pub mod weight;

pub use coupler::Coupler;
pub use error::{CouplerError, Result};
