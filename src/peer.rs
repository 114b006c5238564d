//! The all-to-all description exchange: every process learns
//! the grid, rank, and local box of every other participant, and filters
//! that list down to the peers it actually talks to.
//!
//! Grounded on `original_source/lib/router.cc::exchange_descriptions`: a
//! fixed-width record per process, gathered to rank 0 and broadcast back
//! out. The teacher's FIXME ("check that the domains the remote procs
//! don't overlap") is implemented here rather than left outstanding.

use std::collections::HashMap;

use crate::comm::CollectiveTransport;
use crate::config::Config;
use crate::error::{CouplerError, ErrorContext, Result};
use crate::grid::{Box2D, GridDescriptor};

/// The number of `u32` words in the marshaled description record:
/// `grid_id, rank, lis, lie, ljs, lje`. Matches `DESCRIPTION_SIZE` in
/// `original_source/lib/router.cc`.
pub const DESCRIPTION_SIZE: usize = 6;

/// One participant's description, as broadcast by [`exchange_descriptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub grid_id: u32,
    pub rank: u32,
    pub local: Box2D,
}

impl PeerDescriptor {
    fn marshal(&self) -> [u32; DESCRIPTION_SIZE] {
        [
            self.grid_id,
            self.rank,
            self.local.row_start as u32,
            self.local.row_end as u32,
            self.local.col_start as u32,
            self.local.col_end as u32,
        ]
    }

    fn unmarshal(words: &[u32]) -> Self {
        Self {
            grid_id: words[0],
            rank: words[1],
            local: Box2D::new(
                words[2] as i64,
                words[3] as i64,
                words[4] as i64,
                words[5] as i64,
            ),
        }
    }
}

/// A remote participant on a peer grid, plus the point-ownership test
/// `owns(global_idx)`.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub grid_name: String,
    pub rank: usize,
    pub local: Box2D,
    global_cols: i64,
}

impl RemotePeer {
    /// Does this peer own the cell that `gidx` refers to, on its grid?
    pub fn owns(&self, gidx: u64) -> bool {
        let gidx = gidx as i64;
        let row = gidx / self.global_cols;
        let col = gidx % self.global_cols;
        self.local.contains_cell(row, col)
    }

    /// Number of columns in the peer grid's global box, as inferred from
    /// the union of all retained peers on it ([`PeerDirectory::fix_up_global_cols`]).
    pub fn global_cols(&self) -> i64 {
        self.global_cols
    }

    /// Builds a peer directly, for callers (route construction, tests) that
    /// already know the peer grid's column count rather than deriving it
    /// through [`PeerDirectory::exchange`].
    pub fn new(grid_name: impl Into<String>, rank: usize, local: Box2D, global_cols: i64) -> Self {
        Self {
            grid_name: grid_name.into(),
            rank,
            local,
            global_cols,
        }
    }
}

/// The result of the description exchange, filtered to peers this process
/// actually communicates with.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    /// peer grid name -> peers on that grid
    peers_by_grid: HashMap<String, Vec<RemotePeer>>,
}

impl PeerDirectory {
    /// Runs the description exchange: marshal this process's description,
    /// gather+broadcast it to an identical list on every rank, then retain only peers on a grid this process
    /// configures traffic with, and validate that
    /// each retained grid's peers exactly tile its global box.
    pub fn exchange<T: CollectiveTransport>(
        transport: &T,
        config: &Config,
        local: &GridDescriptor,
    ) -> Result<Self> {
        let my_grid_id = config.grid_id(local.name()).ok_or_else(|| {
            CouplerError::config(format!("grid '{}' is not present in configuration", local.name()))
        })? as u32;

        let my_description = PeerDescriptor {
            grid_id: my_grid_id,
            rank: local.rank() as u32,
            local: local.local_box(),
        };

        const ROOT: usize = 0;
        let payload: Vec<u8> = my_description
            .marshal()
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();

        let gathered = transport.gather(ROOT, payload.clone())?;
        let concatenated = match gathered {
            Some(all) => all.concat(),
            None => Vec::new(),
        };
        let broadcasted = transport.broadcast(
            ROOT,
            if transport.rank() == ROOT {
                Some(concatenated)
            } else {
                None
            },
        )?;

        let word_count = broadcasted.len() / 4;
        let words: Vec<u32> = (0..word_count)
            .map(|i| {
                let b = &broadcasted[i * 4..i * 4 + 4];
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            })
            .collect();

        let role = config.resolve(local.name());
        let mut peers_by_grid: HashMap<String, Vec<RemotePeer>> = HashMap::new();

        for chunk in words.chunks(DESCRIPTION_SIZE) {
            if chunk.len() < DESCRIPTION_SIZE {
                break;
            }
            let desc = PeerDescriptor::unmarshal(chunk);
            let grid_name = match config.grid_name(desc.grid_id as usize) {
                Some(name) => name,
                None => continue,
            };
            let is_relevant =
                role.dest_grids.contains(grid_name) || role.src_grids.contains(grid_name);
            if !is_relevant || grid_name == local.name() {
                continue;
            }
            peers_by_grid
                .entry(grid_name.to_string())
                .or_default()
                .push(RemotePeer {
                    grid_name: grid_name.to_string(),
                    rank: desc.rank as usize,
                    local: desc.local,
                    // Fixed up below once the full peer set per grid is known.
                    global_cols: 0,
                });
        }

        let directory = Self { peers_by_grid };
        directory.validate()?;
        Ok(directory)
    }

    /// Validates, for each retained grid, that the known peers' local boxes
    /// are pairwise disjoint and their union equals the bounding box they
    /// collectively describe.
    ///
    /// This only ever checks tiling of the peers' *inferred* bounding box,
    /// not the grid's declared global box: the 6-word [`PeerDescriptor`]
    /// record carries `lis/lie/ljs/lje` but no `gis/gie/gjs/gje`, so a
    /// missing peer at the true global box's edge looks identical to a
    /// smaller, fully-tiled global box. A correct consequence of the wire
    /// format, not a gap in this check.
    fn validate(&self) -> Result<()> {
        for (grid_name, peers) in &self.peers_by_grid {
            for i in 0..peers.len() {
                for j in (i + 1)..peers.len() {
                    if peers[i].local.overlaps(&peers[j].local) {
                        return Err(CouplerError::topology(format!(
                            "peers {} and {} on grid '{}' have overlapping local boxes",
                            peers[i].rank, peers[j].rank, grid_name
                        ))
                        .with_context(ErrorContext::grid(grid_name.clone())));
                    }
                }
            }
            let total_area: i64 = peers.iter().map(|p| p.local.area()).sum();
            if let Some(bounds) = Self::bounding_box(peers) {
                if total_area != bounds.area() {
                    return Err(CouplerError::topology(format!(
                        "peers on grid '{grid_name}' leave a gap: local boxes cover {total_area} \
                         cells but their bounding box has {} cells",
                        bounds.area()
                    ))
                    .with_context(ErrorContext::grid(grid_name.clone())));
                }
            }
        }
        Ok(())
    }

    /// The bounding box of a set of peers sharing a grid; equal to the
    /// grid's global box once [`Self::validate`] has confirmed they tile it
    /// exactly. Exposed for [`crate::route`]'s dense peer-lookup map.
    pub(crate) fn bounding_box(peers: &[RemotePeer]) -> Option<Box2D> {
        let first = peers.first()?.local;
        let mut bounds = first;
        for peer in &peers[1..] {
            bounds.row_start = bounds.row_start.min(peer.local.row_start);
            bounds.row_end = bounds.row_end.max(peer.local.row_end);
            bounds.col_start = bounds.col_start.min(peer.local.col_start);
            bounds.col_end = bounds.col_end.max(peer.local.col_end);
        }
        Some(bounds)
    }

    /// Fixes up each retained peer's `global_cols` (needed for `owns`) now
    /// that the full peer set for its grid is known: it is the number of
    /// columns in the bounding box of all peers on that grid.
    pub fn fix_up_global_cols(&mut self) {
        let columns: HashMap<String, i64> = self
            .peers_by_grid
            .iter()
            .filter_map(|(name, peers)| Self::bounding_box(peers).map(|b| (name.clone(), b.cols())))
            .collect();
        for (name, peers) in self.peers_by_grid.iter_mut() {
            if let Some(&cols) = columns.get(name) {
                for peer in peers.iter_mut() {
                    peer.global_cols = cols;
                }
            }
        }
    }

    /// Peers on the given grid, in rank order.
    pub fn peers_on(&self, grid_name: &str) -> &[RemotePeer] {
        self.peers_by_grid
            .get(grid_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Finds the peer on `grid_name` that owns `gidx`. `None` if no
    /// retained peer claims it (caller turns this into
    /// [`CouplerError::Topology`]).
    pub fn find_owner(&self, grid_name: &str, gidx: u64) -> Option<&RemotePeer> {
        self.peers_on(grid_name).iter().find(|p| p.owns(gidx))
    }
}
