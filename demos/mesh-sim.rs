//! TDMA mesh simulation
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn, error};
use rand::{Rng, SeedableRng, rngs::StdRng};
use structopt::StructOpt;

use tdmesh::prelude::*;
use tdmesh::sim::{SimMedium, SimRadio, SimState, SimInfo, SimError};
use tdmesh::timer::mock::MockTimer;

type SimEngine = Engine<SimRadio, SimState, SimInfo, SimError, MockTimer, StdRng>;

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "4")]
    /// Number of member nodes
    pub members: usize,

    #[structopt(long)]
    /// Members only hear the coordinator and adjacent members
    pub chain: bool,

    #[structopt(long, default_value = "30s", parse(try_from_str = humantime::parse_duration))]
    /// Simulated run time
    pub duration: Duration,

    #[structopt(long, default_value = "2s", parse(try_from_str = humantime::parse_duration))]
    /// Interval between application transmissions per node
    pub tx_interval: Duration,

    #[structopt(long, default_value = "500")]
    /// Simulation step in us
    pub step_us: u64,

    #[structopt(long, default_value = "0.01")]
    /// Probability of corrupting a transmitted frame
    pub corrupt: f64,

    #[structopt(long, default_value = "1")]
    /// Seed for simulation randomness
    pub seed: u64,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

struct SimNode {
    engine: SimEngine,
    radio: SimRadio,
    neighbours: Vec<Address>,
    last_tx: u64,
}

fn main() -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Bind exit handler
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let opts = Options::from_args();

    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    info!("Starting mesh-sim with {} members", opts.members);

    let medium = SimMedium::new();
    let mut timer = MockTimer::new();
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mut nodes = Vec::with_capacity(opts.members + 1);

    for i in 0..=opts.members {
        let address = Address(0x1000 + i as u64);
        let config = Config {
            coordinator: i == 0,
            callsign: Callsign::new(&format!("SIM{}", i)).ok_or_else(|| anyhow::anyhow!("Invalid callsign"))?,
            join_class: match i % 4 {
                0 => QosClass::Data,
                1 => QosClass::Voice,
                2 => QosClass::Video,
                _ => QosClass::Data,
            },
            ..Default::default()
        };

        let radio = medium.radio();
        let engine = Engine::new(address, config, radio.clone(), timer.clone(), StdRng::seed_from_u64(opts.seed + i as u64))
            .map_err(|e| anyhow::anyhow!("Error initialising node {}: {:?}", address, e))?;

        nodes.push(SimNode{ engine, radio, neighbours: vec![], last_tx: 0 });
    }

    // Every member hears the coordinator, chains only their neighbours otherwise
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            if opts.chain && i != 0 && j != i + 1 {
                continue;
            }

            let rssi = -50 - rng.gen_range(0..30);
            medium.connect(&nodes[i].radio, &nodes[j].radio, rssi);

            let (a, b) = (nodes[i].engine.address(), nodes[j].engine.address());
            nodes[i].neighbours.push(b);
            nodes[j].neighbours.push(a);
        }
    }

    let end = opts.duration.as_micros() as u64;
    let tx_interval = opts.tx_interval.as_micros() as u64;
    let mut last_report = 0;

    while running.load(Ordering::SeqCst) && timer.val() < end {
        let now = timer.val();

        // Link quality estimates
        if now >= last_report + 250_000 {
            for n in nodes.iter_mut() {
                for l in n.neighbours.clone() {
                    let report = QualityReport {
                        link: l,
                        snr_db: rng.gen_range(8.0..30.0),
                        packet_loss: rng.gen_range(0.0..0.1),
                        latency_ms: rng.gen_range(5.0..50.0),
                    };
                    let mcs = n.engine.report_quality(report);
                    debug!("{} -> {}: {}", n.engine.address(), l, mcs.name());
                }
            }
            last_report = now;
        }

        let addresses: Vec<_> = nodes.iter().map(|n| n.engine.address()).collect();

        for n in nodes.iter_mut() {
            if rng.gen_bool(opts.corrupt) {
                medium.corrupt_next(&n.radio);
            }

            if let Err(e) = n.engine.tick() {
                error!("{} tick error: {:?}", n.engine.address(), e);
            }

            while let Some(e) = n.engine.poll_event() {
                info!("{} event: {:?}", n.engine.address(), e);
            }

            let mut buff = [0u8; 256];
            while let Some((len, i)) = n.engine.receive(&mut buff).map_err(|e| anyhow::anyhow!("RX error: {:?}", e))? {
                info!("{} received {:02x?} from {} via {} ({})", n.engine.address(), &buff[..len], i.source, i.via, i.class);
            }

            // Periodic transmit to a random peer
            if n.engine.mac().state().is_synced() && now >= n.last_tx + tx_interval {
                let dest = addresses[rng.gen_range(0..addresses.len())];
                if dest != n.engine.address() {
                    let data = (now / 1000).to_le_bytes();
                    if let Err(e) = n.engine.send(dest, ServiceType::Bulk, &data) {
                        warn!("{} TX to {} failed: {:?}", n.engine.address(), dest, e);
                    }
                }
                n.last_tx = now;
            }
        }

        timer.inc_us(opts.step_us);
    }

    for n in &nodes {
        info!("{}: {}", n.engine.address(), n.engine.health());
    }
    info!("{} frames on the medium", medium.frames());

    Ok(())
}
