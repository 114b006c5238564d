//! The thin user-facing API: `init`, `begin_transfer`, `put`, `get`,
//! `end_transfer`, `finalize`. Everything else in this crate is the
//! machinery [`Coupler`] is assembled from.
//!
//! One adaptation from the original C-shaped API, carried up from
//! [`crate::transfer::TransferEngine`] (see that module's doc comment):
//! `get` registers a field name and expected length rather than taking an
//! output buffer, since holding a caller's buffer pointer across the
//! `get`/`end_transfer` call boundary has no safe Rust equivalent. The
//! accumulated buffers come back as the return value of `end_transfer`,
//! keyed by field name; the zero-then-accumulate semantics are unchanged.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::comm::CollectiveTransport;
use crate::config::Config;
use crate::error::{CouplerError, Result};
use crate::grid::{Box2D, GridDescriptor};
use crate::peer::PeerDirectory;
use crate::plan::RoutingPlan;
use crate::route::RouteBuilder;
use crate::transfer::TransferEngine;

/// Name of the configuration file, resolved relative to
/// `cfg_dir` in [`Coupler::init`].
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// The coupler runtime's public façade: one per participating process,
/// wrapping a fixed [`GridDescriptor`], [`PeerDirectory`], [`RoutingPlan`],
/// and [`TransferEngine`] for the lifetime of a run.
pub struct Coupler<T: CollectiveTransport> {
    local: GridDescriptor,
    directory: PeerDirectory,
    plan: RoutingPlan,
    engine: TransferEngine<T>,
}

impl<T: CollectiveTransport> Coupler<T> {
    /// Validates the local box, loads `<cfg_dir>/config.yaml`, runs the
    /// all-to-all description exchange, and builds the routing plan. Any
    /// failure here is fatal: no `Coupler` is ever returned with a partial
    /// plan.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        transport: T,
        cfg_dir: impl AsRef<Path>,
        grid_name: &str,
        lis: i64,
        lie: i64,
        ljs: i64,
        lje: i64,
        gis: i64,
        gie: i64,
        gjs: i64,
        gje: i64,
    ) -> Result<Self> {
        let cfg_dir: PathBuf = cfg_dir.as_ref().to_path_buf();
        let config = Config::load(cfg_dir.join(CONFIG_FILE_NAME))?;

        let local = GridDescriptor::new(
            grid_name,
            transport.rank(),
            Box2D::new(lis, lie, ljs, lje),
            Box2D::new(gis, gie, gjs, gje),
        )?;

        let mut directory = PeerDirectory::exchange(&transport, &config, &local)?;
        directory.fix_up_global_cols();

        let role = config.resolve(grid_name);
        validate_no_field_tag_collisions(&role)?;

        let builder = RouteBuilder::new();
        let plan = RoutingPlan::build_with_csv(&cfg_dir, &config, &local, &directory, &builder)?;

        log::info!(
            "coupler init complete: grid='{grid_name}' rank={} owned_points={}",
            local.rank(),
            local.num_owned()
        );

        let engine = TransferEngine::new(transport, local.clone(), role);

        Ok(Self {
            local,
            directory,
            plan,
            engine,
        })
    }

    /// This process's [`GridDescriptor`], fixed since `init`.
    pub fn grid(&self) -> &GridDescriptor {
        &self.local
    }

    /// The peers this process exchanges data with, as resolved at `init`.
    pub fn peer_directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// The routing plan built at `init`. Read-only; shared freely.
    pub fn routing_plan(&self) -> &RoutingPlan {
        &self.plan
    }

    /// `IDLE -> OPEN(timestep, peer_grid)`.
    pub fn begin_transfer(&mut self, timestep: i64, peer_grid: &str) -> Result<()> {
        self.engine.begin_transfer(timestep, peer_grid)
    }

    /// Queues an outbound field while a window is open.
    pub fn put(&mut self, field: &str, buf: &[f64], n: usize) -> Result<()> {
        if buf.len() != n {
            return Err(CouplerError::shape(format!(
                "put('{field}'): buffer has {} elements but n={n}",
                buf.len()
            )));
        }
        self.engine.put(field, buf)
    }

    /// Queues an inbound field while a window is open. The accumulated
    /// values come back from [`Self::end_transfer`].
    pub fn get(&mut self, field: &str, n: usize) -> Result<()> {
        self.engine.get(field, n)
    }

    /// Flushes the pending exchange, waits for completion, and barriers.
    /// Returns every requested field's
    /// accumulated buffer, keyed by field name.
    pub fn end_transfer(&mut self) -> Result<HashMap<String, Vec<f64>>> {
        self.engine.end_transfer(&self.plan)
    }

    /// Releases the routing plan and scratch state. Consumes `self`: Rust's ownership model makes "released" mean
    /// "dropped" rather than a separately-trackable state.
    pub fn finalize(self) {
        drop(self);
    }
}

/// Deterministic FNV-1a hash of a field name, folded to 16 bits. Used to tag
/// messages by `(field_id, timestep)` without an extra per-window handshake.
fn field_hash16(name: &str) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    ((hash >> 16) ^ (hash & 0xFFFF)) as u16
}

/// The message tag for one field's payload within a transfer window: the
/// field's 16-bit hash in the low bits, the timestep (mod 2^11) above it,
/// with the top bit clear so it can never collide with
/// [`field_exchange_tag`]/[`field_request_tag`] or the reserved collective
/// tags in [`crate::comm`] (which all have every high bit set).
pub fn field_tag(field: &str, timestep: i64) -> u32 {
    let hash = field_hash16(field) as u32;
    let ts = (timestep.rem_euclid(1 << 11)) as u32;
    (ts << 16) | hash
}

/// The tag for a sender's per-window "these are the fields I'm putting"
/// announcement, sent to its send-side peers. Top bit set distinguishes it
/// from every [`field_tag`], which always has the top bit clear.
pub fn field_exchange_tag(timestep: i64) -> u32 {
    let ts = (timestep.rem_euclid(1 << 20)) as u32;
    0x8000_0000 | ts
}

/// The tag for a receiver's per-window "these are the fields I'm getting"
/// announcement, sent to its recv-side peers. Top two bits set distinguishes
/// it from [`field_exchange_tag`] (top bit only) and every [`field_tag`]
/// (neither bit set), so the two announcements never collide in a single
/// peer's FIFO stream even when that peer is both a send and a recv target
/// in the same window.
pub fn field_request_tag(timestep: i64) -> u32 {
    let ts = (timestep.rem_euclid(1 << 20)) as u32;
    0xC000_0000 | ts
}

/// Rejects configurations where two distinct field names hash to the same
/// 16-bit tag.
fn validate_no_field_tag_collisions(role: &crate::config::RoleResolution) -> Result<()> {
    let mut all_fields: HashSet<&str> = HashSet::new();
    for fields in role.dest_grid_to_fields.values() {
        all_fields.extend(fields.iter().map(String::as_str));
    }
    for fields in role.src_grid_to_fields.values() {
        all_fields.extend(fields.iter().map(String::as_str));
    }

    let mut seen: HashMap<u16, &str> = HashMap::new();
    for field in all_fields {
        let hash = field_hash16(field);
        if let Some(other) = seen.insert(hash, field) {
            if other != field {
                return Err(CouplerError::config(format!(
                    "field names '{other}' and '{field}' hash to the same tag; rename one"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::LoopbackGroup;
    use std::thread;

    fn write_config(dir: &Path) {
        std::fs::write(
            dir.join(CONFIG_FILE_NAME),
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
    }

    fn write_identity_weights(dir: &Path) {
        let body: String = (0..16u64).map(|k| format!("{k},{k},1.0\n")).collect();
        std::fs::write(dir.join("atm_to_ocean_rmp.csv"), body).unwrap();
    }

    #[test]
    fn field_tag_is_stable_and_distinct_from_exchange_tag() {
        assert_eq!(field_tag("sst", 3), field_tag("sst", 3));
        assert_ne!(field_tag("sst", 3), field_tag("taux", 3));
        assert_ne!(field_tag("sst", 3), field_exchange_tag(3));
        assert_ne!(field_tag("sst", 3), field_request_tag(3));
        assert_ne!(field_exchange_tag(3), field_request_tag(3));
    }

    #[test]
    fn collision_check_passes_for_distinct_field_names() {
        let config: Config = serde_yaml::from_str(
            r#"
grids:
  - name: atm
    destinations:
      - name: ocean
        vars: [sst, taux, u, v]
"#,
        )
        .unwrap();
        let role = config.resolve("atm");
        assert!(validate_no_field_tag_collisions(&role).is_ok());
    }

    #[test]
    fn init_builds_a_working_coupler_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        write_identity_weights(dir.path());

        let group = LoopbackGroup::new(2);
        let values = vec![
            292.1, 295.7, 290.5, 287.9, 291.3, 294.3, 291.8, 290.0, 292.1, 295.2, 290.8, 284.7,
            293.3, 290.1, 297.8, 293.4,
        ];

        let cfg_dir_send = dir.path().to_path_buf();
        let send_values = values.clone();
        let send = {
            let transport = group.transport(0);
            thread::spawn(move || {
                let mut coupler =
                    Coupler::init(transport, &cfg_dir_send, "atm", 0, 4, 0, 4, 0, 4, 0, 4).unwrap();
                coupler.begin_transfer(0, "ocean").unwrap();
                coupler.put("sst", &send_values, 16).unwrap();
                coupler.end_transfer().unwrap();
                coupler.finalize();
            })
        };

        let cfg_dir_recv = dir.path().to_path_buf();
        let recv = {
            let transport = group.transport(1);
            thread::spawn(move || {
                let mut coupler =
                    Coupler::init(transport, &cfg_dir_recv, "ocean", 0, 4, 0, 4, 0, 4, 0, 4)
                        .unwrap();
                coupler.begin_transfer(0, "atm").unwrap();
                coupler.get("sst", 16).unwrap();
                let results = coupler.end_transfer().unwrap();
                coupler.finalize();
                results
            })
        };

        send.join().unwrap();
        let results = recv.join().unwrap();
        assert_eq!(results["sst"], values);
    }

    #[test]
    fn init_rejects_grid_not_in_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        write_identity_weights(dir.path());

        let group = LoopbackGroup::new(1);
        let transport = group.transport(0);
        let err = Coupler::init(transport, dir.path(), "ice", 0, 2, 0, 2, 0, 2, 0, 2).unwrap_err();
        assert!(matches!(err, CouplerError::Config { .. }));
    }
}
