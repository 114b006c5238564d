//! Joins owned points, a weight table, and a peer directory into the
//! per-peer send/recv routes that make up a [`crate::plan::RoutingPlan`]
//!.
//!
//! Grounded on `original_source/lib/router.cc::build_routing_rules` and its
//! companion `clean_unreferenced_remote_procs`: scan the weight table once,
//! bucket each entry by which peer owns its far endpoint, then drop peers
//! that ended up with nothing. The peer-by-box linear scan that routine
//! uses is replaced here by a
//! dense `global_idx -> peer` map once a grid's point count passes
//! [`LARGE_GRID_THRESHOLD`].

use std::collections::HashMap;

use crate::error::{CouplerError, ErrorContext, Result};
use crate::grid::{Box2D, GridDescriptor};
use crate::peer::{PeerDirectory, RemotePeer};
use crate::weight::WeightTable;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Weight magnitude below which an entry is discarded.
pub const DEFAULT_EPSILON: f64 = 1e-12;

/// Above this many points on a peer grid, [`RouteBuilder`] indexes peers by
/// a dense `global_idx -> peer` vector instead of scanning the peer list
/// per weight entry.
pub const LARGE_GRID_THRESHOLD: usize = 100_000;

/// One peer's contribution to a send or receive route: the local points
/// involved and their weights, ordered by `(src_gidx, dst_gidx)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRoute {
    pub peer_rank: usize,
    pub grid: String,
    pub points: Vec<u64>,
    pub weights: Vec<f64>,
}

impl PeerRoute {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// O(1) `global_idx -> peer index` resolution, switching representation at
/// [`LARGE_GRID_THRESHOLD`].
///
/// The dense table is indexed relative to `bounds`' own origin, not by the
/// raw global index: a grid whose global box does not start at `(0, 0)`
/// (`gis > 0` / `gjs > 0`) would otherwise need a table sized to the
/// absolute extent of the grid rather than to the peer set's own footprint,
/// and every valid point would index past the allocated table.
enum PeerLookup {
    Dense {
        bounds: Box2D,
        global_cols: i64,
        table: Vec<i32>,
    },
    Linear,
}

impl PeerLookup {
    fn build(peers: &[RemotePeer]) -> Self {
        let total_points: usize = peers.iter().map(|p| p.local.area() as usize).sum();
        if total_points <= LARGE_GRID_THRESHOLD {
            return PeerLookup::Linear;
        }
        let bounds = match PeerDirectory::bounding_box(peers) {
            Some(b) => b,
            None => return PeerLookup::Linear,
        };
        let global_cols = peers
            .first()
            .map(|p| p.global_cols())
            .unwrap_or_else(|| bounds.cols());
        let stride = bounds.cols().max(0) as usize;
        let size = bounds.area().max(0) as usize;
        let mut table = vec![-1i32; size];
        for (idx, peer) in peers.iter().enumerate() {
            for row in peer.local.row_start..peer.local.row_end {
                for col in peer.local.col_start..peer.local.col_end {
                    let r = (row - bounds.row_start) as usize;
                    let c = (col - bounds.col_start) as usize;
                    let offset = r * stride + c;
                    if offset < table.len() {
                        table[offset] = idx as i32;
                    }
                }
            }
        }
        PeerLookup::Dense {
            bounds,
            global_cols,
            table,
        }
    }

    fn find<'a>(&self, peers: &'a [RemotePeer], gidx: u64) -> Option<&'a RemotePeer> {
        match self {
            PeerLookup::Linear => peers.iter().find(|p| p.owns(gidx)),
            PeerLookup::Dense {
                bounds,
                global_cols,
                table,
            } => {
                let gidx = gidx as i64;
                let row = gidx / global_cols;
                let col = gidx % global_cols;
                if !bounds.contains_cell(row, col) {
                    return None;
                }
                let r = (row - bounds.row_start) as usize;
                let c = (col - bounds.col_start) as usize;
                let offset = r * bounds.cols() as usize + c;
                let slot = table.get(offset).copied().unwrap_or(-1);
                if slot < 0 {
                    None
                } else {
                    peers.get(slot as usize)
                }
            }
        }
    }
}

/// Builds send/recv routes for one peer grid at a time; see
/// [`build_send_plan`]/[`build_recv_plan`] for the multi-grid drivers used
/// by plan assembly.
#[derive(Debug, Clone, Copy)]
pub struct RouteBuilder {
    epsilon: f64,
}

impl Default for RouteBuilder {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl RouteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Builds the send routes from `local` to `peer_grid`: for every weight
    /// entry whose `src` this process owns and whose weight clears `ε`,
    /// locate the peer owning `dst` and append `(src, w)` to that peer's
    /// route. Peers with no entries are dropped; each surviving peer's
    /// pairs are sorted by `(src, dst)`.
    pub fn build_send_routes(
        &self,
        local: &GridDescriptor,
        peer_grid: &str,
        peers: &[RemotePeer],
        table: &WeightTable,
    ) -> Result<Vec<PeerRoute>> {
        let lookup = PeerLookup::build(peers);
        let mut by_peer: HashMap<usize, Vec<(u64, u64, f64)>> = HashMap::new();

        for entry in table.iter() {
            if !local.contains(entry.src_gidx) || entry.weight.abs() <= self.epsilon {
                continue;
            }
            let peer = lookup.find(peers, entry.dst_gidx).ok_or_else(|| {
                CouplerError::topology(format!(
                    "no peer on grid '{peer_grid}' owns destination point {}",
                    entry.dst_gidx
                ))
                .with_context(ErrorContext::grid(peer_grid.to_string()))
            })?;
            by_peer
                .entry(peer.rank)
                .or_default()
                .push((entry.src_gidx, entry.dst_gidx, entry.weight));
        }

        Ok(Self::finalize_routes(peer_grid, by_peer, |src, _dst| src))
    }

    /// Builds the receive routes from `peer_grid` into `local`: for every
    /// weight entry whose `dst` this process owns and whose weight clears
    /// `ε`, locate the peer owning `src` and append `(dst, w)` to that
    /// peer's route. The weight
    /// table passed here must be the `(peer_grid -> local grid)` table, a
    /// distinct load from the send-side table for the same pair.
    pub fn build_recv_routes(
        &self,
        local: &GridDescriptor,
        peer_grid: &str,
        peers: &[RemotePeer],
        table: &WeightTable,
    ) -> Result<Vec<PeerRoute>> {
        let lookup = PeerLookup::build(peers);
        let mut by_peer: HashMap<usize, Vec<(u64, u64, f64)>> = HashMap::new();

        for entry in table.iter() {
            if !local.contains(entry.dst_gidx) || entry.weight.abs() <= self.epsilon {
                continue;
            }
            let peer = lookup.find(peers, entry.src_gidx).ok_or_else(|| {
                CouplerError::topology(format!(
                    "no peer on grid '{peer_grid}' owns source point {}",
                    entry.src_gidx
                ))
                .with_context(ErrorContext::grid(peer_grid.to_string()))
            })?;
            by_peer
                .entry(peer.rank)
                .or_default()
                .push((entry.src_gidx, entry.dst_gidx, entry.weight));
        }

        Ok(Self::finalize_routes(peer_grid, by_peer, |_src, dst| dst))
    }

    /// Common tail of both route-construction passes: sort each peer's
    /// pairs by `(src, dst)`, drop peers left
    /// with no surviving entries, and
    /// project each pair down to the point value the caller wants to keep
    /// (`src` for send routes, `dst` for recv routes).
    fn finalize_routes(
        peer_grid: &str,
        by_peer: HashMap<usize, Vec<(u64, u64, f64)>>,
        point_of: impl Fn(u64, u64) -> u64,
    ) -> Vec<PeerRoute> {
        let mut routes: Vec<PeerRoute> = by_peer
            .into_iter()
            .filter(|(_, pairs)| !pairs.is_empty())
            .map(|(peer_rank, mut pairs)| {
                pairs.sort_by_key(|&(src, dst, _)| (src, dst));
                let (points, weights): (Vec<u64>, Vec<f64>) = pairs
                    .iter()
                    .map(|&(src, dst, w)| (point_of(src, dst), w))
                    .unzip();
                PeerRoute {
                    peer_rank,
                    grid: peer_grid.to_string(),
                    points,
                    weights,
                }
            })
            .collect();
        routes.sort_by_key(|r| r.peer_rank);
        routes
    }
}

/// Runs [`RouteBuilder::build_send_routes`] across every configured
/// destination grid, optionally in parallel.
pub fn build_send_plan(
    builder: &RouteBuilder,
    local: &GridDescriptor,
    directory: &PeerDirectory,
    weight_tables: &HashMap<String, WeightTable>,
) -> Result<HashMap<String, Vec<PeerRoute>>> {
    let grid_names: Vec<&String> = weight_tables.keys().collect();

    let build_one = |grid_name: &&String| -> Result<(String, Vec<PeerRoute>)> {
        let peers = directory.peers_on(grid_name);
        let table = &weight_tables[*grid_name];
        let routes = builder.build_send_routes(local, grid_name, peers, table)?;
        Ok(((*grid_name).clone(), routes))
    };

    #[cfg(feature = "rayon")]
    let results: Vec<Result<(String, Vec<PeerRoute>)>> =
        grid_names.par_iter().map(build_one).collect();
    #[cfg(not(feature = "rayon"))]
    let results: Vec<Result<(String, Vec<PeerRoute>)>> =
        grid_names.iter().map(build_one).collect();

    results.into_iter().collect()
}

/// Runs [`RouteBuilder::build_recv_routes`] across every configured source
/// grid, optionally in parallel.
pub fn build_recv_plan(
    builder: &RouteBuilder,
    local: &GridDescriptor,
    directory: &PeerDirectory,
    weight_tables: &HashMap<String, WeightTable>,
) -> Result<HashMap<String, Vec<PeerRoute>>> {
    let grid_names: Vec<&String> = weight_tables.keys().collect();

    let build_one = |grid_name: &&String| -> Result<(String, Vec<PeerRoute>)> {
        let peers = directory.peers_on(grid_name);
        let table = &weight_tables[*grid_name];
        let routes = builder.build_recv_routes(local, grid_name, peers, table)?;
        Ok(((*grid_name).clone(), routes))
    };

    #[cfg(feature = "rayon")]
    let results: Vec<Result<(String, Vec<PeerRoute>)>> =
        grid_names.par_iter().map(build_one).collect();
    #[cfg(not(feature = "rayon"))]
    let results: Vec<Result<(String, Vec<PeerRoute>)>> =
        grid_names.iter().map(build_one).collect();

    results.into_iter().collect()
}
