//! A two-rank, single-process demo of the public API, modeled on
//! `original_source/test/atm.cc`: an atmosphere component that puts
//! `air_temp`/`sw_flux` to an ocean component every timestep.
//!
//! Run with `cargo run --example atm`. Both ranks run in-process over
//! `message::LoopbackTransport`; a real deployment would launch one process
//! per rank and hand each a `TcpTransport` or `MpiTransport` instead.

use std::thread;

use tango_couple::message::LoopbackGroup;
use tango_couple::Coupler;

const NUM_TIMESTEPS: i64 = 20;
const FIELD_LEN: usize = 10;

fn write_fixtures(dir: &std::path::Path) {
    std::fs::write(
        dir.join("config.yaml"),
        r#"
grids:
  - name: atm
    destinations:
      - name: ocean
        vars: [air_temp, sw_flux]
  - name: ocean
"#,
    )
    .unwrap();

    let identity: String = (0..FIELD_LEN as u64)
        .map(|k| format!("{k},{k},1.0\n"))
        .collect();
    std::fs::write(dir.join("atm_to_ocean_rmp.csv"), identity).unwrap();
}

fn main() {
    env_logger::init();

    let dir = tempfile::tempdir().expect("create fixture dir");
    write_fixtures(dir.path());

    let group = LoopbackGroup::new(2);

    let atm_dir = dir.path().to_path_buf();
    let atm_transport = group.transport(0);
    let atm = thread::spawn(move || {
        let mut coupler = Coupler::init(
            atm_transport,
            &atm_dir,
            "atm",
            0,
            1,
            0,
            FIELD_LEN as i64,
            0,
            1,
            0,
            FIELD_LEN as i64,
        )
        .expect("atm init");

        let air_temp = vec![288.0; FIELD_LEN];
        let sw_flux = vec![200.0; FIELD_LEN];

        for time in 0..NUM_TIMESTEPS {
            coupler.begin_transfer(time, "ocean").unwrap();
            coupler.put("air_temp", &air_temp, FIELD_LEN).unwrap();
            coupler.put("sw_flux", &sw_flux, FIELD_LEN).unwrap();
            coupler.end_transfer().unwrap();
        }
        coupler.finalize();
    });

    let ocean_dir = dir.path().to_path_buf();
    let ocean_transport = group.transport(1);
    let ocean = thread::spawn(move || {
        let mut coupler = Coupler::init(
            ocean_transport,
            &ocean_dir,
            "ocean",
            0,
            1,
            0,
            FIELD_LEN as i64,
            0,
            1,
            0,
            FIELD_LEN as i64,
        )
        .expect("ocean init");

        for time in 0..NUM_TIMESTEPS {
            coupler.begin_transfer(time, "atm").unwrap();
            coupler.get("air_temp", FIELD_LEN).unwrap();
            coupler.get("sw_flux", FIELD_LEN).unwrap();
            let received = coupler.end_transfer().unwrap();
            println!(
                "timestep {time}: air_temp[0]={} sw_flux[0]={}",
                received["air_temp"][0], received["sw_flux"][0]
            );
        }
        coupler.finalize();
    });

    atm.join().expect("atm thread");
    ocean.join().expect("ocean thread");
}
