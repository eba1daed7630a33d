//! Protocol engine composing the TDMA MAC, adaptive modulation and routing
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt::{self, Debug};
use std::collections::VecDeque;

use log::{trace, debug, warn};
use rand_core::RngCore;

use crate::{Radio, Ts, timer::Timer, error::CoreError};
use crate::amc::{Amc, Mcs, QualityReport};
use crate::config::Config;
use crate::mac::{Mac, MacEvent, MacState, RxInfo, Tdma};
use crate::node::Address;
use crate::qos::{QosClass, ServiceType};
use crate::route::Router;

/// OGMs processed per tick
pub const OGM_BUDGET: usize = 8;

/// Buffered events
pub const EVENT_LEN: usize = 32;

/// Bulk transfer chunk size
pub const BULK_CHUNK_LEN: usize = 2048;

/// Engine health summary
#[derive(Debug, Clone, PartialEq)]
pub struct Health {
    pub state: MacState,
    pub neighbours: usize,
    pub routes: usize,
    pub tx_frames: u32,
    pub success_rate: f32,
    pub crc_failure_rate: f32,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} neighbours, {} routes, {} tx ({:.1}% ok), {:.1}% crc failures",
            self.state, self.neighbours, self.routes, self.tx_frames,
            self.success_rate * 100.0, self.crc_failure_rate * 100.0)
    }
}

/// Mesh node: runs the MAC each tick, then routing work outside slot handling
pub struct Engine<R, S, I, E, T, G> {
    mac: Tdma<R, S, I, E, T, G>,
    amc: Amc,
    router: Router,

    ogm_interval: Ts,
    last_ogm: Option<Ts>,
    last_purge: Ts,

    events: VecDeque<MacEvent>,
}

impl <R, S, I, E, T, G> Engine<R, S, I, E, T, G>
where
    R: Radio<S, I, E> + radio::Channel<Error=E>,
    <R as radio::Channel>::Channel: From<u16>,
    S: radio::RadioState,
    I: radio::ReceiveInfo + Default + Debug,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    pub fn new(address: Address, config: Config, radio: R, timer: T, rng: G) -> Result<Self, CoreError<E>> {
        config.validate()?;

        let amc = Amc::new(config.amc.clone(), config.routing.weights.clone());
        let router = Router::new(address, config.routing.clone(), amc.reader());
        let ogm_interval = config.routing.ogm_interval_us;

        let mac = Tdma::new(address, config, radio, timer, rng, amc.reader(), router.reader())?;
        let now = mac.now();

        debug!("Engine {} started at {} us", address, now);

        Ok(Self {
            mac,
            amc,
            router,
            ogm_interval,
            last_ogm: None,
            last_purge: now,
            events: VecDeque::new(),
        })
    }

    pub fn mac(&self) -> &Tdma<R, S, I, E, T, G> {
        &self.mac
    }

    pub fn mac_mut(&mut self) -> &mut Tdma<R, S, I, E, T, G> {
        &mut self.mac
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn amc(&self) -> &Amc {
        &self.amc
    }

    pub fn address(&self) -> Address {
        self.mac.address
    }

    /// Feed a link quality measurement, returning the link's selected scheme
    pub fn report_quality(&mut self, report: QualityReport) -> Mcs {
        let now = self.mac.now();
        self.amc.update(report, now)
    }

    /// Request additional slots for the local node
    pub fn request_slot(&mut self, class: QosClass, duration_us: u32) -> Result<(), CoreError<E>> {
        self.mac.request_slot(class, duration_us)
    }

    /// Send application data using a service, returning the number of frames queued
    ///
    /// Emergency broadcasts ignore `dest`. Bulk data is queued only when every
    /// chunk fits in the Data queue.
    pub fn send(&mut self, dest: Address, service: ServiceType, data: &[u8]) -> Result<usize, CoreError<E>> {
        let class = service.class();

        match service {
            ServiceType::Realtime => {
                self.mac.transmit(dest, class, data)?;
                Ok(1)
            },
            ServiceType::EmergencyBroadcast => {
                self.mac.transmit(Address::BROADCAST, class, data)?;
                Ok(1)
            },
            ServiceType::Bulk => {
                let chunks = data.chunks(BULK_CHUNK_LEN).len();
                if chunks > self.mac.tx_queues.free(class) {
                    debug!("Bulk transfer of {} chunks exceeds queue space", chunks);
                    return Err(CoreError::BufferOverflow);
                }

                for c in data.chunks(BULK_CHUNK_LEN) {
                    self.mac.transmit(dest, class, c)?;
                }
                Ok(chunks)
            },
        }
    }

    pub fn poll_event(&mut self) -> Option<MacEvent> {
        self.events.pop_front()
    }

    pub fn health(&self) -> Health {
        let stats = self.mac.stats();

        Health {
            state: self.mac.state(),
            neighbours: self.mac.nodes().iter().filter(|n| n.address != self.mac.address).count(),
            routes: self.router.routes().len(),
            tx_frames: stats.tx_frames,
            success_rate: stats.success_rate(),
            crc_failure_rate: stats.crc_failure_rate(),
        }
    }

    fn push_event(&mut self, e: MacEvent) {
        if self.events.len() >= EVENT_LEN {
            warn!("Event buffer full, dropping {:?}", self.events.pop_front());
        }
        self.events.push_back(e);
    }

    /// Routing maintenance: inbound OGMs, origination and purge
    fn route(&mut self, now: Ts) {
        for _ in 0..OGM_BUDGET {
            let (from, ogm) = match self.mac.poll_ogm() {
                Some(v) => v,
                None => break,
            };

            if let Some(relay) = self.router.process(from, &ogm, now) {
                trace!("Relay OGM {} from {}", relay.seq, relay.originator);
                self.mac.queue_ogm(relay);
            }
        }

        let due = self.last_ogm.map(|t| now.saturating_sub(t) >= self.ogm_interval).unwrap_or(true);
        if due && self.mac.state().is_synced() {
            let ogm = self.router.originate(now);
            self.mac.queue_ogm(ogm);
            self.last_ogm = Some(now);
        }

        if now.saturating_sub(self.last_purge) >= self.ogm_interval {
            let n = self.router.purge(now);
            if n > 0 {
                debug!("Purged {} routes", n);
            }
            self.last_purge = now;
        }
    }
}

impl <R, S, I, E, T, G> Mac for Engine<R, S, I, E, T, G>
where
    R: Radio<S, I, E> + radio::Channel<Error=E>,
    <R as radio::Channel>::Channel: From<u16>,
    S: radio::RadioState,
    I: radio::ReceiveInfo + Default + Debug,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    type Error = CoreError<E>;

    fn transmit(&mut self, dest: Address, class: QosClass, data: &[u8]) -> Result<(), Self::Error> {
        self.mac.transmit(dest, class, data)
    }

    fn receive(&mut self, buff: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error> {
        self.mac.receive(buff)
    }

    fn busy(&mut self) -> Result<bool, Self::Error> {
        self.mac.busy()
    }

    fn tick(&mut self) -> Result<(), Self::Error> {
        self.mac.tick()?;

        let now = self.mac.now();

        while let Some(e) = self.mac.poll_event() {
            match &e {
                MacEvent::NodeLost(a) => self.amc.remove(a),
                MacEvent::NoBeacon | MacEvent::JoinFailed => self.last_ogm = None,
                _ => (),
            }
            self.push_event(e);
        }

        self.route(now);

        Ok(())
    }
}
