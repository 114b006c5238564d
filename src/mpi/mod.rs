//! FFI declarations for the thin MPI shim compiled by `build.rs` from
//! `src/mpi/mpi.c`. `probe` takes an explicit `source` because
//! [`crate::comm::CollectiveTransport::recv`] addresses messages by
//! `(src_rank, tag)` rather than tag alone.

#[repr(C)]
pub struct Status {
    pub count: i32,
    pub source: i32,
    pub tag: i32,
}

extern "C" {
    pub fn init() -> i32;
    pub fn finalize();
    pub fn comm_rank() -> i32;
    pub fn comm_size() -> i32;
    pub fn send(buf: *const u8, count: i32, dest: i32, tag: i32);
    pub fn recv(buf: *mut u8, count: i32, source: i32, tag: i32);
    pub fn probe(source: i32, tag: i32) -> Status;
}
