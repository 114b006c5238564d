//! Loads the YAML-like configuration file and resolves, for the
//! local grid, which grids it sends to / receives from and which fields
//! flow over each edge — the same resolution
//! `original_source/lib/router.cc::parse_config` performs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    pub name: String,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub grids: Vec<GridConfig>,
}

impl Config {
    /// Loads and parses the configuration file. Malformed YAML is
    /// `CouplerError::Config` via `From<serde_yaml::Error>`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    /// The 0-based position of `grid_name` in the configuration, i.e. its
    /// `grid_id` for the description-exchange protocol.
    pub fn grid_id(&self, grid_name: &str) -> Option<usize> {
        self.grids.iter().position(|g| g.name == grid_name)
    }

    pub fn grid_name(&self, grid_id: usize) -> Option<&str> {
        self.grids.get(grid_id).map(|g| g.name.as_str())
    }

    pub fn num_grids(&self) -> usize {
        self.grids.len()
    }

    /// Resolves, from the perspective of `my_grid`, the routing roles this
    /// process plays: which grids it is a configured source for, which it
    /// is a configured destination for, and which fields flow over each
    /// edge. Mirrors `router.cc`'s `dest_grids`/`src_grids`/
    /// `dest_grid_to_fields_map`/`src_grid_to_fields_map`.
    pub fn resolve(&self, my_grid: &str) -> RoleResolution {
        let mut dest_grids = BTreeSet::new();
        let mut src_grids = BTreeSet::new();
        let mut dest_grid_to_fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut src_grid_to_fields: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for grid in &self.grids {
            for dest in &grid.destinations {
                if grid.name == my_grid {
                    dest_grids.insert(dest.name.clone());
                    dest_grid_to_fields
                        .entry(dest.name.clone())
                        .or_default()
                        .extend(dest.vars.iter().cloned());
                } else if dest.name == my_grid {
                    src_grids.insert(grid.name.clone());
                    src_grid_to_fields
                        .entry(grid.name.clone())
                        .or_default()
                        .extend(dest.vars.iter().cloned());
                }
            }
        }

        RoleResolution {
            dest_grids,
            src_grids,
            dest_grid_to_fields,
            src_grid_to_fields,
        }
    }
}

/// What a grid participant sends to, receives from, and over which fields,
/// as resolved from [`Config::resolve`].
#[derive(Debug, Clone, Default)]
pub struct RoleResolution {
    pub dest_grids: BTreeSet<String>,
    pub src_grids: BTreeSet<String>,
    pub dest_grid_to_fields: BTreeMap<String, Vec<String>>,
    pub src_grid_to_fields: BTreeMap<String, Vec<String>>,
}

impl RoleResolution {
    pub fn fields_sent_to(&self, peer_grid: &str) -> &[String] {
        self.dest_grid_to_fields
            .get(peer_grid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn fields_received_from(&self, peer_grid: &str) -> &[String] {
        self.src_grid_to_fields
            .get(peer_grid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
grids:
  - name: atm
    destinations:
      - name: ocean
        vars: [sst, taux]
  - name: ocean
    destinations:
      - name: atm
        vars: [u, v]
  - name: ice
"#;

    #[test]
    fn grid_id_is_array_position() {
        let cfg: Config = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(cfg.grid_id("atm"), Some(0));
        assert_eq!(cfg.grid_id("ocean"), Some(1));
        assert_eq!(cfg.grid_id("ice"), Some(2));
        assert_eq!(cfg.grid_id("missing"), None);
    }

    #[test]
    fn resolve_splits_send_and_recv_roles() {
        let cfg: Config = serde_yaml::from_str(YAML).unwrap();
        let atm = cfg.resolve("atm");
        assert!(atm.dest_grids.contains("ocean"));
        assert!(atm.src_grids.contains("ocean"));
        assert_eq!(atm.fields_sent_to("ocean"), &["sst".to_string(), "taux".to_string()]);
        assert_eq!(atm.fields_received_from("ocean"), &["u".to_string(), "v".to_string()]);

        let ice = cfg.resolve("ice");
        assert!(ice.dest_grids.is_empty());
        assert!(ice.src_grids.is_empty());
    }

    #[test]
    fn load_rejects_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "grids: [this is not: valid: yaml: at all").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn load_round_trips_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, YAML).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.num_grids(), 3);
    }
}
