//! Executes `begin_transfer`/`put`/`get`/`end_transfer` windows against a
//! [`crate::plan::RoutingPlan`].
//!
//! Grounded on `original_source/test/CC/tango_ctest.cc`'s three transfer
//! scenarios for the exact packing/accumulation semantics, and on
//! gridiron's `automaton::coordinate` for the general shape of deferring
//! delivery until a synchronization point.
//!
//! One adaptation from the reference's C-pointer style: `get` does not take
//! a caller-owned output buffer to write into later, since retaining a raw
//! pointer across the `get`/`end_transfer` call boundary has no safe,
//! non-`unsafe` Rust equivalent. Instead `get` just registers the field and
//! its expected length; `end_transfer` returns the accumulated buffers by
//! value, keyed by field name. The zero-then-accumulate semantics are
//! preserved exactly; only the handle by which the caller retrieves the
//! result changes.

use std::collections::{BTreeSet, HashMap};
use std::convert::TryInto;

use crate::comm::CollectiveTransport;
use crate::config::RoleResolution;
use crate::coupler::{field_exchange_tag, field_request_tag, field_tag};
use crate::error::{CouplerError, ErrorContext, Result};
use crate::grid::GridDescriptor;
use crate::plan::RoutingPlan;

#[derive(Debug, Clone, PartialEq)]
enum EngineState {
    Idle,
    Open { timestep: i64, peer_grid: String },
}

struct PendingPut {
    field: String,
    values: Vec<f64>,
}

struct PendingGet {
    field: String,
    len: usize,
}

/// Drives one participant's side of `begin/put/get/end` transfer windows
/// against a fixed [`RoutingPlan`].
pub struct TransferEngine<T: CollectiveTransport> {
    transport: T,
    local: GridDescriptor,
    role: RoleResolution,
    state: EngineState,
    puts: Vec<PendingPut>,
    gets: Vec<PendingGet>,
}

impl<T: CollectiveTransport> TransferEngine<T> {
    pub fn new(transport: T, local: GridDescriptor, role: RoleResolution) -> Self {
        Self {
            transport,
            local,
            role,
            state: EngineState::Idle,
            puts: Vec::new(),
            gets: Vec::new(),
        }
    }

    /// `IDLE -> OPEN(timestep, peer_grid)`. Fails with `ProtocolError` if a
    /// window is already open.
    pub fn begin_transfer(&mut self, timestep: i64, peer_grid: &str) -> Result<()> {
        if let EngineState::Open { peer_grid: open_grid, .. } = &self.state {
            return Err(CouplerError::protocol(format!(
                "begin_transfer('{peer_grid}') called while a window with '{open_grid}' is still open"
            ))
            .with_context(ErrorContext::default().with_timestep(timestep)));
        }
        if !self.role.dest_grids.contains(peer_grid) && !self.role.src_grids.contains(peer_grid) {
            return Err(CouplerError::config(format!(
                "'{peer_grid}' is not a configured peer grid for '{}'",
                self.local.name()
            )));
        }
        self.puts.clear();
        self.gets.clear();
        self.state = EngineState::Open {
            timestep,
            peer_grid: peer_grid.to_string(),
        };
        log::debug!("begin_transfer(timestep={timestep}, peer_grid={peer_grid})");
        Ok(())
    }

    fn open_window(&self) -> Result<(i64, String)> {
        match &self.state {
            EngineState::Open { timestep, peer_grid } => Ok((*timestep, peer_grid.clone())),
            EngineState::Idle => Err(CouplerError::protocol(
                "no transfer window is open (begin_transfer was not called, or already ended)",
            )),
        }
    }

    /// Queues an outbound field while `OPEN`. `values.len()` must equal the
    /// number of locally owned points, else `ShapeError`.
    pub fn put(&mut self, field: &str, values: &[f64]) -> Result<()> {
        let (_, peer_grid) = self.open_window()?;
        if values.len() != self.local.num_owned() {
            return Err(CouplerError::shape(format!(
                "put('{field}'): buffer has {} values, expected {}",
                values.len(),
                self.local.num_owned()
            )));
        }
        if !self
            .role
            .fields_sent_to(&peer_grid)
            .iter()
            .any(|f| f == field)
        {
            return Err(CouplerError::config(format!(
                "'{field}' is not a configured field from '{}' to '{peer_grid}'",
                self.local.name()
            )));
        }
        self.puts.push(PendingPut {
            field: field.to_string(),
            values: values.to_vec(),
        });
        Ok(())
    }

    /// Queues an inbound field while `OPEN`. `n` must equal the number of
    /// locally owned points, else `ShapeError`. The accumulated buffer is
    /// returned from [`Self::end_transfer`], keyed by `field`.
    pub fn get(&mut self, field: &str, n: usize) -> Result<()> {
        let (_, peer_grid) = self.open_window()?;
        if n != self.local.num_owned() {
            return Err(CouplerError::shape(format!(
                "get('{field}'): requested {n} values, expected {}",
                self.local.num_owned()
            )));
        }
        if !self
            .role
            .fields_received_from(&peer_grid)
            .iter()
            .any(|f| f == field)
        {
            return Err(CouplerError::config(format!(
                "'{field}' is not a configured field into '{}' from '{peer_grid}'",
                self.local.name()
            )));
        }
        self.gets.push(PendingGet {
            field: field.to_string(),
            len: n,
        });
        Ok(())
    }

    /// Executes the pending exchange: packs and posts sends for every `put`,
    /// posts receives for every `get` and accumulates weighted
    /// contributions, barriers, then returns `IDLE`. `ProtocolError` if no window is open.
    pub fn end_transfer(&mut self, plan: &RoutingPlan) -> Result<HashMap<String, Vec<f64>>> {
        let (timestep, peer_grid) =
            match std::mem::replace(&mut self.state, EngineState::Idle) {
                EngineState::Open { timestep, peer_grid } => (timestep, peer_grid),
                EngineState::Idle => {
                    return Err(CouplerError::protocol(
                        "end_transfer called without a matching begin_transfer",
                    ))
                }
            };

        let send_routes = plan.send_routes(&peer_grid);
        let recv_routes = plan.recv_routes(&peer_grid);

        self.exchange_field_names(send_routes, recv_routes, timestep)?;

        let mut send_handles = Vec::new();
        for put in &self.puts {
            let tag = field_tag(&put.field, timestep);
            for route in send_routes {
                let packed: Vec<f64> = route
                    .points
                    .iter()
                    .zip(route.weights.iter())
                    .map(|(&gidx, &w)| {
                        let offset = self
                            .local
                            .local_offset(gidx)
                            .expect("RouteBuilder only emits points this process owns");
                        put.values[offset] * w
                    })
                    .collect();
                send_handles.push(self.transport.post_send(route.peer_rank, tag, pack_f64(&packed))?);
            }
        }

        let mut results: HashMap<String, Vec<f64>> = HashMap::new();
        for get in &self.gets {
            let tag = field_tag(&get.field, timestep);
            let mut handles = Vec::new();
            for route in recv_routes {
                handles.push(self.transport.post_recv(route.peer_rank, tag)?);
            }
            let payloads = self.transport.wait_all(Vec::new(), handles)?;

            let mut buffer = vec![0.0; get.len];
            for (route, payload) in recv_routes.iter().zip(payloads.iter()) {
                let values = unpack_f64(payload);
                for (&gidx, &v) in route.points.iter().zip(values.iter()) {
                    let offset = self
                        .local
                        .local_offset(gidx)
                        .expect("RouteBuilder only emits points this process owns");
                    buffer[offset] += v;
                }
            }
            results.insert(get.field.clone(), buffer);
        }

        drop(send_handles);
        self.transport.barrier()?;
        self.puts.clear();
        self.gets.clear();
        log::info!("end_transfer(timestep={timestep}, peer_grid={peer_grid}) complete");
        Ok(results)
    }

    /// The per-timestep field-name exchange, run in both directions so a
    /// mismatch on either side of a `put`/`get` pair is caught (spec §4.5:
    /// "Fields not matched by a peer `get` for a peer `put` (or vice versa)
    /// are a `ProtocolError`"):
    ///
    /// - this process announces its `put` fields to every send-side peer,
    ///   and its `get` fields to every recv-side peer;
    /// - it then checks every local `get` is offered by at least one
    ///   recv-side peer's `put` announcement, and every local `put` is
    ///   wanted by at least one send-side peer's `get` announcement.
    ///
    /// An unclaimed `put` (one no peer `get`s) and an unmatched `get` (one
    /// no peer `put`s) both fail with `ProtocolError`.
    fn exchange_field_names(
        &self,
        send_routes: &[crate::route::PeerRoute],
        recv_routes: &[crate::route::PeerRoute],
        timestep: i64,
    ) -> Result<()> {
        let put_tag = field_exchange_tag(timestep);
        let get_tag = field_request_tag(timestep);

        let mut my_put_fields: Vec<String> = self.puts.iter().map(|p| p.field.clone()).collect();
        my_put_fields.sort();
        let encoded_puts = encode_field_list(&my_put_fields);

        let mut my_get_fields: Vec<String> = self.gets.iter().map(|g| g.field.clone()).collect();
        my_get_fields.sort();
        let encoded_gets = encode_field_list(&my_get_fields);

        for route in send_routes {
            self.transport
                .send(route.peer_rank, put_tag, encoded_puts.clone())?;
        }
        for route in recv_routes {
            self.transport
                .send(route.peer_rank, get_tag, encoded_gets.clone())?;
        }

        let mut recv_peer_ranks: Vec<usize> = recv_routes.iter().map(|r| r.peer_rank).collect();
        recv_peer_ranks.sort_unstable();
        recv_peer_ranks.dedup();

        let mut offered_puts: BTreeSet<String> = BTreeSet::new();
        for rank in recv_peer_ranks {
            let bytes = self.transport.recv(rank, put_tag)?;
            offered_puts.extend(decode_field_list(&bytes));
        }

        let mut send_peer_ranks: Vec<usize> = send_routes.iter().map(|r| r.peer_rank).collect();
        send_peer_ranks.sort_unstable();
        send_peer_ranks.dedup();

        let mut requested_gets: BTreeSet<String> = BTreeSet::new();
        for rank in send_peer_ranks {
            let bytes = self.transport.recv(rank, get_tag)?;
            requested_gets.extend(decode_field_list(&bytes));
        }

        for get in &self.gets {
            if !offered_puts.contains(&get.field) {
                return Err(CouplerError::protocol(format!(
                    "get('{}') has no matching put from any peer this window",
                    get.field
                ))
                .with_context(ErrorContext::default().with_timestep(timestep)));
            }
        }
        for put in &self.puts {
            if !requested_gets.contains(&put.field) {
                return Err(CouplerError::protocol(format!(
                    "put('{}') has no matching get from any peer this window",
                    put.field
                ))
                .with_context(ErrorContext::default().with_timestep(timestep)));
            }
        }
        Ok(())
    }
}

fn pack_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn unpack_f64(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn encode_field_list(fields: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for field in fields {
        let bytes = field.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

fn decode_field_list(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    if bytes.len() < 4 {
        return out;
    }
    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut i = 4;
    for _ in 0..count {
        if i + 4 > bytes.len() {
            break;
        }
        let len = u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap()) as usize;
        i += 4;
        if i + len > bytes.len() {
            break;
        }
        out.push(String::from_utf8_lossy(&bytes[i..i + len]).into_owned());
        i += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::grid::Box2D;
    use crate::message::LoopbackGroup;
    use crate::peer::{PeerDirectory, RemotePeer};
    use crate::route::RouteBuilder;
    use std::collections::HashMap as Map;
    use std::thread;

    fn two_grid_config() -> Config {
        serde_yaml::from_str(
            r#"
grids:
  - name: src
    destinations:
      - name: dst
        vars: [sst]
  - name: dst
"#,
        )
        .unwrap()
    }

    fn identity_plan(
        local: &GridDescriptor,
        peer_grid: &str,
        peer_rank: usize,
        entries: &[(u64, u64, f64)],
        is_send: bool,
    ) -> RoutingPlan {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let body: String = entries
            .iter()
            .map(|(c, r, w)| format!("{c},{r},{w}\n"))
            .collect();
        std::fs::write(&path, body).unwrap();
        let table = crate::weight::WeightTable::load(&path, &crate::weight::CsvWeightReader).unwrap();
        let peers = vec![RemotePeer::new(peer_grid, peer_rank, Box2D::new(0, 4, 0, 4), 4)];
        let builder = RouteBuilder::new();
        let mut send_plan = Map::new();
        let mut recv_plan = Map::new();
        if is_send {
            let routes = builder
                .build_send_routes(local, peer_grid, &peers, &table)
                .unwrap();
            send_plan.insert(peer_grid.to_string(), routes);
        } else {
            let routes = builder
                .build_recv_routes(local, peer_grid, &peers, &table)
                .unwrap();
            recv_plan.insert(peer_grid.to_string(), routes);
        }
        plan_from_parts(send_plan, recv_plan)
    }

    fn plan_from_parts(
        send_plan: Map<String, Vec<crate::route::PeerRoute>>,
        recv_plan: Map<String, Vec<crate::route::PeerRoute>>,
    ) -> RoutingPlan {
        // RoutingPlan's fields are private; tests reconstruct it through the
        // crate-internal constructor below rather than `RoutingPlan::build`,
        // which needs a populated `PeerDirectory` from a real exchange.
        RoutingPlan::from_parts(send_plan, recv_plan)
    }

    #[test]
    fn identity_transfer_round_trips_between_two_ranks() {
        let values = vec![
            292.1, 295.7, 290.5, 287.9, 291.3, 294.3, 291.8, 290.0, 292.1, 295.2, 290.8, 284.7,
            293.3, 290.1, 297.8, 293.4,
        ];
        let config = two_grid_config();
        let group = LoopbackGroup::new(2);
        let identity_entries: Vec<(u64, u64, f64)> = (0..16).map(|k| (k, k, 1.0)).collect();

        let send_values = values.clone();
        let send_thread = {
            let config = config.clone();
            let transport = group.transport(0);
            let entries = identity_entries.clone();
            thread::spawn(move || {
                let local =
                    GridDescriptor::new("src", 0, Box2D::new(0, 4, 0, 4), Box2D::new(0, 4, 0, 4))
                        .unwrap();
                let role = config.resolve("src");
                let plan = identity_plan(&local, "dst", 1, &entries, true);
                let mut engine = TransferEngine::new(transport, local, role);
                engine.begin_transfer(0, "dst").unwrap();
                engine.put("sst", &send_values).unwrap();
                engine.end_transfer(&plan).unwrap();
            })
        };

        let recv_thread = {
            let config = config.clone();
            let transport = group.transport(1);
            let entries = identity_entries;
            thread::spawn(move || {
                let local =
                    GridDescriptor::new("dst", 1, Box2D::new(0, 4, 0, 4), Box2D::new(0, 4, 0, 4))
                        .unwrap();
                let role = config.resolve("dst");
                let plan = identity_plan(&local, "src", 0, &entries, false);
                let mut engine = TransferEngine::new(transport, local, role);
                engine.begin_transfer(0, "src").unwrap();
                engine.get("sst", 16).unwrap();
                engine.end_transfer(&plan).unwrap()
            })
        };

        send_thread.join().unwrap();
        let results = recv_thread.join().unwrap();
        assert_eq!(results["sst"], values);
    }

    /// A `put` that no peer ever `get`s must fail the exchange, not sit
    /// silently unconsumed in the peer's mailbox (spec §4.5). Exercises
    /// `exchange_field_names` directly (rather than through a full
    /// `end_transfer`) since a sender that correctly fails here must never
    /// reach the payload-send phase, which would otherwise leave the
    /// receiver's `wait_all` blocked on a message that is never coming.
    #[test]
    fn put_with_no_matching_get_is_protocol_error() {
        let group = LoopbackGroup::new(2);

        let sender = {
            let transport = group.transport(0);
            thread::spawn(move || {
                let local =
                    GridDescriptor::new("src", 0, Box2D::new(0, 1, 0, 1), Box2D::new(0, 1, 0, 1))
                        .unwrap();
                let config = two_grid_config();
                let role = config.resolve("src");
                let mut engine = TransferEngine::new(transport, local, role);
                engine.puts.push(PendingPut {
                    field: "sst".to_string(),
                    values: vec![],
                });
                engine.puts.push(PendingPut {
                    field: "extra".to_string(),
                    values: vec![],
                });
                let send_routes = vec![crate::route::PeerRoute {
                    peer_rank: 1,
                    grid: "dst".to_string(),
                    points: vec![],
                    weights: vec![],
                }];
                engine.exchange_field_names(&send_routes, &[], 0)
            })
        };

        let receiver = {
            let transport = group.transport(1);
            thread::spawn(move || {
                let local =
                    GridDescriptor::new("dst", 1, Box2D::new(0, 1, 0, 1), Box2D::new(0, 1, 0, 1))
                        .unwrap();
                let config = two_grid_config();
                let role = config.resolve("dst");
                let mut engine = TransferEngine::new(transport, local, role);
                engine.gets.push(PendingGet {
                    field: "sst".to_string(),
                    len: 0,
                });
                let recv_routes = vec![crate::route::PeerRoute {
                    peer_rank: 0,
                    grid: "src".to_string(),
                    points: vec![],
                    weights: vec![],
                }];
                engine.exchange_field_names(&[], &recv_routes, 0)
            })
        };

        let send_result = sender.join().unwrap();
        let recv_result = receiver.join().unwrap();
        assert!(matches!(send_result, Err(CouplerError::Protocol { .. })));
        assert!(recv_result.is_ok());
    }

    #[test]
    fn end_transfer_without_begin_is_protocol_error() {
        let local = GridDescriptor::new("src", 0, Box2D::new(0, 2, 0, 2), Box2D::new(0, 2, 0, 2))
            .unwrap();
        let config = two_grid_config();
        let role = config.resolve("src");
        let transport = crate::message::NullTransport::new();
        let mut engine = TransferEngine::new(transport, local, role);
        let plan = RoutingPlan::from_parts(Map::new(), Map::new());
        let err = engine.end_transfer(&plan).unwrap_err();
        assert!(matches!(err, CouplerError::Protocol { .. }));
    }

    #[test]
    fn put_with_wrong_length_is_shape_error() {
        let local = GridDescriptor::new("src", 0, Box2D::new(0, 2, 0, 2), Box2D::new(0, 2, 0, 2))
            .unwrap();
        let config = two_grid_config();
        let role = config.resolve("src");
        let transport = crate::message::NullTransport::new();
        let mut engine = TransferEngine::new(transport, local, role);
        engine.begin_transfer(0, "dst").unwrap();
        let err = engine.put("sst", &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, CouplerError::Shape { .. }));
    }
}
