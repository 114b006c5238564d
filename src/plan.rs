//! The immutable, read-only-after-build output of routing: a per-grid map
//! of peer routes for sends and another for receives.
//!
//! Built once and queried thereafter, never mutated in place; map keys are
//! peer grid names rather than spatial rectangles.

use std::collections::HashMap;

use crate::config::Config;
use crate::error::Result;
use crate::grid::GridDescriptor;
use crate::peer::PeerDirectory;
use crate::route::{self, PeerRoute, RouteBuilder};
use crate::weight::{CsvWeightReader, WeightFileReader, WeightTable};

use std::path::Path;

/// `{grid_name -> [PeerRoute]}` for sends and receives, built once by
/// [`RoutingPlan::build`] and never mutated afterward.
#[derive(Debug, Clone, Default)]
pub struct RoutingPlan {
    send_plan: HashMap<String, Vec<PeerRoute>>,
    recv_plan: HashMap<String, Vec<PeerRoute>>,
}

impl RoutingPlan {
    /// Assembles a plan directly from already-built send/recv maps, bypassing
    /// weight-file loading. Used by [`crate::coupler::Coupler`] once it has
    /// called [`route::build_send_plan`]/[`route::build_recv_plan`] itself,
    /// and by tests that need a `RoutingPlan` without a live peer exchange.
    pub fn from_parts(
        send_plan: HashMap<String, Vec<PeerRoute>>,
        recv_plan: HashMap<String, Vec<PeerRoute>>,
    ) -> Self {
        Self {
            send_plan,
            recv_plan,
        }
    }

    /// Loads every configured pair's weight table, builds send and receive
    /// routes against the given peer directory, and freezes the result.
    /// Errors here are fatal: no partial plan is ever returned.
    pub fn build(
        cfg_dir: &Path,
        config: &Config,
        local: &GridDescriptor,
        directory: &PeerDirectory,
        builder: &RouteBuilder,
        weight_file_ext: &str,
        reader: &dyn WeightFileReader,
    ) -> Result<Self> {
        let role = config.resolve(local.name());

        let mut send_tables: HashMap<String, WeightTable> = HashMap::new();
        for dest_grid in &role.dest_grids {
            let path = WeightTable::path_for(cfg_dir, local.name(), dest_grid, weight_file_ext);
            send_tables.insert(dest_grid.clone(), WeightTable::load(&path, reader)?);
        }

        let mut recv_tables: HashMap<String, WeightTable> = HashMap::new();
        for src_grid in &role.src_grids {
            let path = WeightTable::path_for(cfg_dir, src_grid, local.name(), weight_file_ext);
            recv_tables.insert(src_grid.clone(), WeightTable::load(&path, reader)?);
        }

        let send_plan = route::build_send_plan(builder, local, directory, &send_tables)?;
        let recv_plan = route::build_recv_plan(builder, local, directory, &recv_tables)?;

        log::info!(
            "routing plan built: {} send peer-grid(s), {} recv peer-grid(s)",
            send_plan.len(),
            recv_plan.len()
        );

        Ok(Self {
            send_plan,
            recv_plan,
        })
    }

    /// Convenience constructor using the shipped [`CsvWeightReader`] and the
    /// conventional `.csv` extension.
    pub fn build_with_csv(
        cfg_dir: &Path,
        config: &Config,
        local: &GridDescriptor,
        directory: &PeerDirectory,
        builder: &RouteBuilder,
    ) -> Result<Self> {
        Self::build(cfg_dir, config, local, directory, builder, "csv", &CsvWeightReader)
    }

    pub fn send_routes(&self, peer_grid: &str) -> &[PeerRoute] {
        self.send_plan
            .get(peer_grid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn recv_routes(&self, peer_grid: &str) -> &[PeerRoute] {
        self.recv_plan
            .get(peer_grid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_send_routes(&self, peer_grid: &str) -> bool {
        self.send_plan.contains_key(peer_grid)
    }

    pub fn has_recv_routes(&self, peer_grid: &str) -> bool {
        self.recv_plan.contains_key(peer_grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Box2D;

    #[test]
    fn missing_weight_file_leaves_no_partial_plan() {
        let dir = tempfile::tempdir().unwrap();
        let config: Config = serde_yaml::from_str(
            r#"
grids:
  - name: atm
    destinations:
      - name: ocean
        vars: [sst]
  - name: ocean
"#,
        )
        .unwrap();

        let local = GridDescriptor::new("atm", 0, Box2D::new(0, 2, 0, 2), Box2D::new(0, 2, 0, 2))
            .unwrap();
        // `PeerDirectory`'s only public constructor is `exchange`, which
        // needs a transport; plan assembly against a populated directory is
        // exercised end to end in the integration tests under `tests/`.
        // A missing weight file is an IO error and no partial plan escapes
        // `build`.
        let directory = PeerDirectory::default();
        let builder = RouteBuilder::new();
        let result = RoutingPlan::build(
            dir.path(),
            &config,
            &local,
            &directory,
            &builder,
            "does_not_exist",
            &CsvWeightReader,
        );
        assert!(result.is_err());
    }
}
