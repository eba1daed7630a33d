//! Mesh routing engine
//!
//! Distance-vector routing driven by periodic originator messages (OGMs).
//! Each node floods its own OGM with a full TTL, neighbours scale the
//! advertised metric by the composite metric of the link it arrived on and
//! relay it onwards only when it improved or refreshed their route. Up to
//! [`MAX_BACKUPS`] alternative next hops are retained per destination so
//! forwarding can fail over as soon as a link stops reporting, without
//! waiting for the next OGM round.
//!
//! The [`Router`] is the sole writer of the route table, forwarding reads
//! published snapshots through [`NextHop`].
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, trace};

use crate::Ts;
use crate::amc::LinkTable;
use crate::codec::Ogm;
use crate::error::{ConfigError, CoreError};
use crate::node::Address;
use crate::snapshot::{Publisher, Reader};

pub mod metric;
use metric::MetricWeights;

/// Backup next hops retained per destination
pub const MAX_BACKUPS: usize = 3;

/// Upper bound for the hop limit
pub const MAX_HOPS: u8 = 32;

/// Metrics closer than this are considered equal cost
const EQUAL_COST_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingConfig {
    pub weights: MetricWeights,
    /// Fractional metric penalty applied per hop, in [0, 1)
    pub hop_penalty: f32,
    /// Interval between originated OGMs
    pub ogm_interval_us: Ts,
    /// Missed OGM intervals before a route expires
    pub ogm_window: u32,
    /// Sequence numbers older than the best seen by more than this are replays
    pub replay_window: u16,
    /// TTL of originated OGMs
    pub max_hops: u8,
    /// Silence after which a link is not used for forwarding
    pub link_timeout_us: Ts,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            weights: MetricWeights::default(),
            hop_penalty: 0.0,
            ogm_interval_us: 1_000_000,
            ogm_window: 5,
            replay_window: 64,
            max_hops: MAX_HOPS,
            link_timeout_us: 3_000_000,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;

        if self.hop_penalty.is_nan() || !(0.0..1.0).contains(&self.hop_penalty) {
            return Err(ConfigError::MetricWeights);
        }
        if self.max_hops == 0 || self.max_hops > MAX_HOPS {
            return Err(ConfigError::MaxHops);
        }
        if self.ogm_window == 0 || self.ogm_interval_us == 0 {
            return Err(ConfigError::OgmWindow);
        }

        Ok(())
    }

    /// Time after which an unrefreshed route expires
    pub fn route_expiry(&self) -> Ts {
        self.ogm_interval_us * self.ogm_window as Ts
    }
}

/// Next hop candidate for a destination
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub via: Address,
    /// Path metric in [0, 1]
    pub metric: f32,
    pub hops: u8,
    /// Last OGM sequence heard via this neighbour
    pub seq: u16,
    pub updated: Ts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub destination: Address,
    pub primary: Candidate,
    /// Alternatives ordered by descending metric, distinct from the primary
    pub backups: heapless::Vec<Candidate, MAX_BACKUPS>,
    /// Newest sequence number seen from the originator
    pub seq: u16,
    pub updated: Ts,
}

impl RouteEntry {
    fn new(destination: Address, c: Candidate) -> Self {
        Self {
            destination,
            primary: c,
            backups: heapless::Vec::new(),
            seq: c.seq,
            updated: c.updated,
        }
    }

    /// Primary then backups in preference order
    pub fn candidates(&self) -> impl Iterator<Item=&Candidate> {
        core::iter::once(&self.primary).chain(self.backups.iter())
    }

    fn remove_backup(&mut self, via: Address) -> Option<Candidate> {
        let i = self.backups.iter().position(|b| b.via == via)?;
        Some(self.backups.swap_remove(i))
    }

    fn insert_backup(&mut self, c: Candidate) {
        if c.via == self.primary.via {
            return;
        }
        self.remove_backup(c.via);

        if self.backups.len() == MAX_BACKUPS {
            match self.backups.last() {
                Some(worst) if worst.metric >= c.metric => return,
                _ => { self.backups.pop(); },
            }
        }

        let _ = self.backups.push(c);
        self.sort_backups();
    }

    fn sort_backups(&mut self) {
        self.backups.sort_by(|a, b| b.metric.total_cmp(&a.metric));
    }

    /// Swap in the best backup carrying the newest sequence when it beats
    /// the primary, returning whether the primary changed
    fn rerank(&mut self) -> bool {
        let seq = self.seq;
        let best = self.backups.iter()
            .enumerate()
            .filter(|(_, b)| !newer(seq, b.seq))
            .max_by(|(_, a), (_, b)| a.metric.total_cmp(&b.metric))
            .map(|(i, b)| (i, b.metric));

        match best {
            Some((i, metric)) if metric > self.primary.metric => {
                let b = self.backups.swap_remove(i);
                let previous = core::mem::replace(&mut self.primary, b);
                let _ = self.backups.push(previous);
                self.sort_backups();
                true
            },
            _ => {
                self.sort_backups();
                false
            },
        }
    }

    /// Replace the primary with the best backup, if any
    fn promote(&mut self) -> bool {
        match self.backups.is_empty() {
            true => false,
            false => {
                self.primary = self.backups.swap_remove(0);
                self.sort_backups();
                true
            }
        }
    }
}

pub type RouteTable = BTreeMap<Address, RouteEntry>;

/// Whether sequence `a` is newer than `b` under wrapping arithmetic
fn newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// Route table maintenance, owned by the engine's low priority work
pub struct Router {
    address: Address,
    config: RoutingConfig,
    links: Reader<LinkTable>,

    seq: u16,
    routes: RouteTable,
    /// Last sequence accepted per (originator, neighbour)
    seen: BTreeMap<(Address, Address), (u16, Ts)>,

    publisher: Publisher<RouteTable>,
}

impl Router {
    pub fn new(address: Address, config: RoutingConfig, links: Reader<LinkTable>) -> Self {
        Self {
            address,
            config,
            links,
            seq: 0,
            routes: RouteTable::new(),
            seen: BTreeMap::new(),
            publisher: Publisher::new(RouteTable::new()),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn route(&self, destination: &Address) -> Option<&RouteEntry> {
        self.routes.get(destination)
    }

    /// Non-blocking next hop lookup over the published tables
    pub fn reader(&self) -> NextHop {
        NextHop::new(self.publisher.reader(), self.links.clone(), self.config.link_timeout_us)
    }

    /// Generate our own advertisement
    pub fn originate(&mut self, _now: Ts) -> Ogm {
        let ogm = Ogm {
            originator: self.address,
            seq: self.seq,
            ttl: self.config.max_hops,
            metric: 1.0,
            prev_hop: self.address,
        };

        self.seq = self.seq.wrapping_add(1);

        trace!("Originate OGM seq {}", ogm.seq);

        ogm
    }

    /// Process an OGM received from neighbour `from`, returning the OGM to
    /// relay if the route table was updated
    pub fn process(&mut self, from: Address, ogm: &Ogm, now: Ts) -> Option<Ogm> {
        if ogm.ttl == 0 {
            trace!("Drop OGM from {}: TTL exhausted", from);
            return None;
        }
        if ogm.originator == self.address || from == self.address || ogm.prev_hop == self.address {
            trace!("Drop OGM from {}: own or echoed advertisement", from);
            return None;
        }
        if !(0.0..=1.0).contains(&ogm.metric) {
            debug!("Drop OGM from {}: metric {} outside [0, 1]", from, ogm.metric);
            return None;
        }

        let links = self.links.load().clone();
        let link = match links.get(&from) {
            Some(l) if l.is_live(now, self.config.link_timeout_us) => l.smoothed_metric,
            _ => {
                trace!("Drop OGM from {}: no link quality", from);
                return None;
            }
        };

        if let Some((last, _)) = self.seen.get(&(ogm.originator, from)) {
            if !newer(ogm.seq, *last) {
                trace!("Drop OGM {} seq {} via {}: duplicate", ogm.originator, ogm.seq, from);
                return None;
            }
        }

        if let Some(e) = self.routes.get(&ogm.originator) {
            if e.seq.wrapping_sub(ogm.seq) as i16 as i32 > self.config.replay_window as i32 {
                debug!("Drop OGM {} seq {} via {}: outside replay window", ogm.originator, ogm.seq, from);
                return None;
            }
        }

        self.seen.insert((ogm.originator, from), (ogm.seq, now));

        let ttl = ogm.ttl.min(self.config.max_hops);
        let metric = ogm.metric * link * (1.0 - self.config.hop_penalty);
        let c = Candidate {
            via: from,
            metric,
            hops: self.config.max_hops - ttl + 1,
            seq: ogm.seq,
            updated: now,
        };

        let updated = match self.routes.get_mut(&ogm.originator) {
            None => {
                info!("New route to {} via {} (metric: {:.3} hops: {})", ogm.originator, from, metric, c.hops);
                self.routes.insert(ogm.originator, RouteEntry::new(ogm.originator, c));
                true
            },
            Some(e) if newer(e.seq, ogm.seq) => {
                // Older than the newest advertisement, only usable as an alternative
                trace!("OGM {} seq {} via {} behind seq {}", ogm.originator, ogm.seq, from, e.seq);

                match e.primary.via == from {
                    true => e.primary = c,
                    false => e.insert_backup(c),
                }
                e.rerank();
                false
            },
            Some(e) => {
                e.seq = ogm.seq;

                if e.primary.via == from {
                    e.primary = c;
                    e.updated = now;
                    if e.rerank() {
                        debug!("Route to {} moved to {} after refresh via {}", ogm.originator, e.primary.via, from);
                    }
                    true

                } else if metric > e.primary.metric {
                    debug!("Route to {} via {} replaces {} ({:.3} > {:.3})",
                            ogm.originator, from, e.primary.via, metric, e.primary.metric);

                    e.remove_backup(from);
                    let previous = core::mem::replace(&mut e.primary, c);
                    e.insert_backup(previous);
                    e.updated = now;
                    true

                } else {
                    e.insert_backup(c);
                    false
                }
            }
        };

        // Backups change forwarding too
        self.publish();

        match (updated, ttl - 1) {
            (true, ttl) if ttl > 0 => Some(Ogm {
                originator: ogm.originator,
                seq: ogm.seq,
                ttl,
                metric,
                prev_hop: from,
            }),
            _ => None,
        }
    }

    /// Expire stale routes and candidates, returning the number of routes removed
    pub fn purge(&mut self, now: Ts) -> usize {
        let expiry = self.config.route_expiry();
        let stale = |t: Ts| now.saturating_sub(t) > expiry;

        let mut changed = false;
        let mut removed = vec![];

        for (dest, e) in self.routes.iter_mut() {
            let n = e.backups.len();
            while let Some(i) = e.backups.iter().position(|b| stale(b.updated)) {
                e.backups.swap_remove(i);
            }
            if n != e.backups.len() {
                e.sort_backups();
                changed = true;
            }

            if stale(e.primary.updated) {
                changed = true;
                match e.promote() {
                    true => debug!("Route to {} failed over to {}", dest, e.primary.via),
                    false => removed.push(*dest),
                }
            }
        }

        for d in &removed {
            info!("Route to {} expired", d);
            self.routes.remove(d);
        }

        self.seen.retain(|_, (_, t)| !stale(*t));

        if changed {
            self.publish();
        }

        removed.len()
    }

    fn publish(&mut self) {
        self.publisher.publish(self.routes.clone());
    }
}

/// Destination without a usable next hop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unreachable(pub Address);

impl <E> From<Unreachable> for CoreError<E> {
    fn from(u: Unreachable) -> Self {
        CoreError::RouteUnreachable(u.0)
    }
}

/// Forwarding lookup state, holding the last committed snapshots and the
/// per-destination round-robin cursors
pub struct NextHop {
    routes: Reader<RouteTable>,
    links: Reader<LinkTable>,
    link_timeout: Ts,
    cursors: BTreeMap<Address, usize>,
}

impl NextHop {
    pub fn new(routes: Reader<RouteTable>, links: Reader<LinkTable>, link_timeout: Ts) -> Self {
        Self{ routes, links, link_timeout, cursors: BTreeMap::new() }
    }

    /// Resolve the next hop towards `dest`, skipping candidates whose link
    /// has not reported within the link timeout
    pub fn next_hop(&mut self, dest: Address, now: Ts) -> Result<Address, Unreachable> {
        if dest.is_broadcast() {
            return Ok(dest);
        }

        let routes: Arc<RouteTable> = self.routes.load().clone();
        let links: Arc<LinkTable> = self.links.load().clone();
        let timeout = self.link_timeout;
        let live = |a: &Address| links.get(a).map(|l| l.is_live(now, timeout)).unwrap_or(false);

        let candidates: Vec<_> = routes.get(&dest)
            .map(|e| e.candidates().filter(|c| live(&c.via)).collect())
            .unwrap_or_default();

        if let Some(best) = candidates.iter().map(|c| c.metric).reduce(f32::max) {
            let equal: Vec<_> = candidates.iter()
                .filter(|c| best - c.metric <= EQUAL_COST_EPSILON)
                .collect();

            match equal.len() {
                0 => (),
                1 => return Ok(equal[0].via),
                n => {
                    let cursor = self.cursors.entry(dest).or_insert(0);
                    let via = equal[*cursor % n].via;
                    *cursor = cursor.wrapping_add(1);

                    return Ok(via);
                }
            }
        }

        // Direct neighbours are reachable before their first OGM
        if live(&dest) {
            return Ok(dest);
        }

        Err(Unreachable(dest))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::amc::{Amc, AmcConfig, QualityReport};

    const LOCAL: Address = Address(0x1);
    const NODE_B: Address = Address(0xb);
    const NODE_C: Address = Address(0xc);
    const NODE_D: Address = Address(0xd);

    fn report(link: Address, snr_db: f32) -> QualityReport {
        QualityReport{ link, snr_db, packet_loss: 0.0, latency_ms: 0.0 }
    }

    fn ogm(originator: Address, seq: u16, ttl: u8, metric: f32) -> Ogm {
        Ogm{ originator, seq, ttl, metric, prev_hop: originator }
    }

    fn setup() -> (Amc, Router) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let amc = Amc::new(AmcConfig::default(), MetricWeights::default());
        let router = Router::new(LOCAL, RoutingConfig::default(), amc.reader());
        (amc, router)
    }

    #[test]
    fn originate() {
        let (_amc, mut r) = setup();

        let a = r.originate(0);
        let b = r.originate(1);

        assert_eq!(a.ttl, MAX_HOPS);
        assert_eq!(a.metric, 1.0);
        assert_eq!(a.originator, LOCAL);
        assert_eq!(b.seq, a.seq + 1);
    }

    #[test]
    fn drop_rules() {
        let (mut amc, mut r) = setup();
        amc.update(report(NODE_B, 30.0), 0);

        // TTL exhausted
        assert_eq!(r.process(NODE_B, &ogm(NODE_D, 1, 0, 1.0), 0), None);
        // Our own OGM
        assert_eq!(r.process(NODE_B, &ogm(LOCAL, 1, 5, 1.0), 0), None);
        // Echo of our own relay
        assert_eq!(r.process(NODE_B, &Ogm{ prev_hop: LOCAL, ..ogm(NODE_D, 1, 5, 1.0) }, 0), None);
        // Neighbour without link quality
        assert_eq!(r.process(NODE_C, &ogm(NODE_D, 1, 5, 1.0), 0), None);

        assert!(r.routes().is_empty());

        // Accepted, then duplicate
        assert!(r.process(NODE_B, &ogm(NODE_D, 1, 5, 1.0), 0).is_some());
        assert_eq!(r.process(NODE_B, &ogm(NODE_D, 1, 5, 1.0), 0), None);
    }

    #[test]
    fn replay_window() {
        let (mut amc, mut r) = setup();
        amc.update(report(NODE_B, 30.0), 0);
        amc.update(report(NODE_C, 30.0), 0);

        r.process(NODE_B, &ogm(NODE_D, 1000, 5, 1.0), 0);

        // Far older sequence from another neighbour is a replay
        assert_eq!(r.process(NODE_C, &ogm(NODE_D, 900, 5, 1.0), 0), None);
        assert!(r.route(&NODE_D).map(|e| e.backups.is_empty()).unwrap());

        // Within the window is a valid alternative path
        r.process(NODE_C, &ogm(NODE_D, 990, 5, 0.5), 0);
        assert_eq!(r.route(&NODE_D).map(|e| e.backups.len()), Some(1));

        // Sequence numbers wrap
        let e = Address(0xe);
        assert!(r.process(NODE_B, &ogm(e, 65535, 5, 1.0), 0).is_some());
        assert!(r.process(NODE_B, &ogm(e, 0, 5, 1.0), 0).is_some());
        assert_eq!(r.route(&e).map(|e| e.seq), Some(0));
        assert_eq!(r.process(NODE_B, &ogm(e, 65535, 5, 1.0), 0), None);
    }

    #[test]
    fn best_path_and_relay() {
        let (mut amc, mut r) = setup();
        amc.update(report(NODE_B, 15.0), 0);
        amc.update(report(NODE_C, 30.0), 0);

        let relay = r.process(NODE_B, &ogm(NODE_D, 1, 10, 1.0), 0).unwrap();
        assert_eq!(relay.ttl, 9);
        assert_eq!(relay.prev_hop, NODE_B);
        assert!((relay.metric - 0.5).abs() < 1e-6);
        assert_eq!(r.route(&NODE_D).map(|e| (e.primary.via, e.primary.hops)), Some((NODE_B, MAX_HOPS - 10 + 1)));

        // Better path replaces the primary, old primary becomes a backup
        assert!(r.process(NODE_C, &ogm(NODE_D, 1, 10, 1.0), 0).is_some());
        let e = r.route(&NODE_D).unwrap();
        assert_eq!(e.primary.via, NODE_C);
        assert_eq!(e.backups.iter().map(|b| b.via).collect::<Vec<_>>(), vec![NODE_B]);

        // Worse path only updates the backup, and is not relayed
        assert_eq!(r.process(NODE_B, &ogm(NODE_D, 2, 10, 1.0), 0), None);

        // Relays stop once the TTL would be exhausted
        assert_eq!(r.process(NODE_C, &ogm(NODE_D, 3, 1, 1.0), 0), None);
        assert_eq!(r.route(&NODE_D).map(|e| e.primary.seq), Some(3));
    }

    #[test]
    fn backups_bounded_and_ordered() {
        let (mut amc, mut r) = setup();

        for n in 2..8 {
            amc.update(report(Address(n), 30.0), 0);
        }
        r.process(Address(7), &ogm(NODE_D, 1, 10, 1.0), 0);

        for n in 2..7 {
            r.process(Address(n), &ogm(NODE_D, 1, 10, n as f32 / 10.0), 0);
        }

        let e = r.route(&NODE_D).unwrap();
        assert_eq!(e.primary.via, Address(7));
        assert_eq!(e.backups.iter().map(|b| b.via).collect::<Vec<_>>(), vec![Address(6), Address(5), Address(4)]);
    }

    #[test]
    fn purge_expires_routes() {
        let (mut amc, mut r) = setup();
        amc.update(report(NODE_B, 30.0), 0);
        amc.update(report(NODE_C, 30.0), 0);

        let expiry = RoutingConfig::default().route_expiry();

        r.process(NODE_B, &ogm(NODE_D, 1, 10, 1.0), 0);
        r.process(NODE_C, &ogm(NODE_D, 1, 10, 0.5), 0);
        assert_eq!(r.purge(expiry), 0);

        // Primary refreshed, backup goes stale
        amc.update(report(NODE_B, 30.0), expiry);
        r.process(NODE_B, &ogm(NODE_D, 2, 10, 1.0), expiry);
        assert_eq!(r.purge(expiry + 1), 0);
        assert!(r.route(&NODE_D).unwrap().backups.is_empty());

        assert_eq!(r.purge(2 * expiry + 1), 1);
        assert!(r.route(&NODE_D).is_none());
    }

    #[test]
    fn failover_on_link_failure() {
        let (mut amc, mut r) = setup();
        let mut next = r.reader();

        amc.update(report(NODE_B, 30.0), 0);
        amc.update(report(NODE_C, 20.0), 0);

        r.process(NODE_B, &ogm(NODE_D, 1, 10, 1.0), 0);
        r.process(NODE_C, &ogm(NODE_D, 1, 10, 1.0), 0);
        assert_eq!(next.next_hop(NODE_D, 0), Ok(NODE_B));

        // B stops reporting while C keeps going
        let t = RoutingConfig::default().link_timeout_us + 1;
        amc.update(report(NODE_C, 20.0), t);
        assert_eq!(next.next_hop(NODE_D, t), Ok(NODE_C));

        // Until C fails too
        let t = 2 * t + 1;
        assert_eq!(next.next_hop(NODE_D, t), Err(Unreachable(NODE_D)));
    }

    #[test]
    fn equal_cost_round_robin() {
        let (mut amc, mut r) = setup();
        let mut next = r.reader();

        amc.update(report(NODE_B, 30.0), 0);
        amc.update(report(NODE_C, 30.0), 0);

        r.process(NODE_B, &ogm(NODE_D, 1, 10, 0.8), 0);
        r.process(NODE_C, &ogm(NODE_D, 1, 10, 0.8), 0);

        let hops: Vec<_> = (0..4).map(|_| next.next_hop(NODE_D, 0).unwrap()).collect();
        assert_eq!(hops, vec![NODE_B, NODE_C, NODE_B, NODE_C]);
    }

    #[test]
    fn direct_neighbours_and_broadcast() {
        let (mut amc, r) = setup();
        let mut next = r.reader();

        amc.update(report(NODE_B, 30.0), 0);

        assert_eq!(next.next_hop(NODE_B, 0), Ok(NODE_B));
        assert_eq!(next.next_hop(Address::BROADCAST, 0), Ok(Address::BROADCAST));
        assert_eq!(next.next_hop(NODE_D, 0), Err(Unreachable(NODE_D)));

        let e: CoreError<()> = Unreachable(NODE_D).into();
        assert_eq!(e, CoreError::RouteUnreachable(NODE_D));
    }

    #[test]
    fn invalid_metrics_dropped() {
        let (mut amc, mut r) = setup();
        let mut next = r.reader();
        amc.update(report(NODE_B, 30.0), 0);

        for m in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY, -0.5, 1.5] {
            assert_eq!(r.process(NODE_B, &ogm(NODE_D, 1, 10, m), 0), None);
        }

        assert!(r.route(&NODE_D).is_none());
        assert_eq!(next.next_hop(NODE_D, 0), Err(Unreachable(NODE_D)));
    }

    #[test]
    fn older_sequence_not_promoted() {
        let (mut amc, mut r) = setup();
        amc.update(report(NODE_B, 15.0), 0);
        amc.update(report(NODE_C, 30.0), 0);

        assert!(r.process(NODE_B, &ogm(NODE_D, 1000, 10, 1.0), 0).is_some());

        // Stronger link carrying an older advertisement is kept as a backup only
        assert_eq!(r.process(NODE_C, &ogm(NODE_D, 950, 10, 1.0), 0), None);

        let e = r.route(&NODE_D).unwrap();
        assert_eq!((e.seq, e.primary.via, e.primary.seq), (1000, NODE_B, 1000));
        assert_eq!(e.backups.iter().map(|b| (b.via, b.seq)).collect::<Vec<_>>(), vec![(NODE_C, 950)]);

        // Takes over once it carries the newest sequence
        assert!(r.process(NODE_C, &ogm(NODE_D, 1000, 10, 1.0), 0).is_some());
        assert_eq!(r.route(&NODE_D).map(|e| e.primary.via), Some(NODE_C));
    }

    #[test]
    fn refreshed_primary_reranked() {
        let (mut amc, mut r) = setup();
        amc.update(report(NODE_B, 30.0), 0);
        amc.update(report(NODE_C, 30.0), 0);

        r.process(NODE_B, &ogm(NODE_D, 1, 10, 0.9), 0);
        r.process(NODE_C, &ogm(NODE_D, 1, 10, 0.5), 0);

        // C hears the next round first, still worse than B
        assert_eq!(r.process(NODE_C, &ogm(NODE_D, 2, 10, 0.6), 0), None);
        assert_eq!(r.route(&NODE_D).map(|e| e.primary.via), Some(NODE_B));

        // B's refresh degrades below C
        r.process(NODE_B, &ogm(NODE_D, 2, 10, 0.3), 0);

        let e = r.route(&NODE_D).unwrap();
        assert_eq!(e.primary.via, NODE_C);
        assert_eq!(e.backups.iter().map(|b| b.via).collect::<Vec<_>>(), vec![NODE_B]);
    }

    proptest! {
        /// Arbitrary metric encodings never reach the route table or break lookups
        #[test]
        fn arbitrary_metric_bits(
            ogms in prop::collection::vec((2u64..5, any::<u32>(), 0u16..8), 1..32),
        ) {
            let (mut amc, mut r) = setup();
            let mut next = r.reader();
            for n in 2..5 {
                amc.update(report(Address(n), 25.0), 0);
            }

            for (from, bits, seq) in ogms {
                let o = ogm(NODE_D, seq, 10, f32::from_bits(bits));

                if let Some(relay) = r.process(Address(from), &o, 0) {
                    prop_assert!((0.0..=1.0).contains(&relay.metric));
                }
                if let Some(e) = r.route(&NODE_D) {
                    prop_assert!(e.candidates().all(|c| (0.0..=1.0).contains(&c.metric)));
                }

                let _ = next.next_hop(NODE_D, 0);
            }
        }

        /// No sequence of OGMs installs a route to or through the local node
        #[test]
        fn no_self_loops(
            ogms in prop::collection::vec((0u64..6, 0u64..6, 0u64..6, any::<u16>(), 0u8..40, 0f32..1.0), 0..64),
        ) {
            let (mut amc, mut r) = setup();
            for n in 0..6 {
                amc.update(report(Address(n), 25.0), 0);
            }

            for (from, originator, prev_hop, seq, ttl, metric) in ogms {
                let o = Ogm{ originator: Address(originator), seq, ttl, metric, prev_hop: Address(prev_hop) };

                if let Some(relay) = r.process(Address(from), &o, 0) {
                    prop_assert!(relay.ttl > 0);
                    prop_assert!(relay.ttl < ttl);
                }

                prop_assert!(r.route(&LOCAL).is_none());
                for e in r.routes().values() {
                    prop_assert!(e.candidates().all(|c| c.via != LOCAL));
                }
            }
        }
    }
}
