//! Beacon-synchronised TDMA MAC
//!
//! A coordinator emits a beacon at the start of each superframe carrying
//! the slot map. Members scan for beacons, join through the contention
//! slot and transmit only in the data slots assigned to them.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;
use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use heapless::spsc::Queue;
use log::{trace, debug, info, warn};
use rand_core::RngCore;

use crate::{Radio, Ts, timer::Timer, error::CoreError};
use crate::amc::{LinkTable, Mcs};
use crate::base::Base;
use crate::codec::{self, MacFrame, MgmtKind, CtrlKind, SeqCtrl, NetworkPacket, Ogm, FrameFlags};
use crate::codec::mgmt::{JoinRequest, RetransmitRequest};
use crate::codec::phy::airtime_us;
use crate::config::{Config, BEACON_SLOT, CONTENTION_SLOT};
use crate::node::{Address, NodeTable, Role};
use crate::qos::{Admission, QosClass, TxQueues, Outbound};
use crate::route::NextHop;
use crate::schedule::{SuperframeSchedule, SlotOwner};
use crate::snapshot::Reader;
use crate::station_id::StationId;

use super::{Mac, MacEvent, MacState, MacStats, RxInfo, SyncRole};

/// Received payload queue depth
pub const RX_QUEUE_LEN: usize = 16;

/// Inbound OGM queue depth
pub const OGM_QUEUE_LEN: usize = 32;

pub const EVENT_QUEUE_LEN: usize = 32;

/// Pending management frames
pub const MGMT_QUEUE_LEN: usize = 16;

/// Unicast frames retained for retransmission on request
pub const ARQ_WINDOW: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JoinState {
    pub attempt: u8,
    /// Superframe in which to send the next request
    pub send_sfn: u64,
    /// Superframe after which an outstanding request has timed out
    pub deadline_sfn: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SentFrame {
    pub frame: MacFrame,
    pub retries: u8,
}

pub struct Tdma<R, S, I, E, T, G> {
    pub address: Address,
    pub(crate) config: Config,
    pub(crate) base: Base<R, S, I, E>,
    timer: T,
    rng: G,

    pub(crate) state: MacState,
    pub(crate) network_id: u16,
    pub(crate) coordinator: Option<Address>,
    pub(crate) schedule: SuperframeSchedule,
    pub(crate) admission: Admission,
    pub(crate) nodes: NodeTable,
    station_id: StationId,

    /// Start of superframe zero in local time
    pub(crate) sync_offset: Ts,
    pub(crate) last_slot: Option<(u64, u8)>,
    pub(crate) last_beacon: Ts,
    pub(crate) beacon_miss_count: u32,

    channel: usize,
    scan_until: Ts,
    pub(crate) join: JoinState,

    seq: u16,
    net_seq: u16,

    links: Reader<LinkTable>,
    routes: NextHop,

    pub(crate) tx_queues: TxQueues,
    /// Pending OGMs by originator, newer advertisements supersede older ones
    ogm_out: BTreeMap<Address, Ogm>,
    pub(crate) ogm_in: Queue<(Address, Ogm), OGM_QUEUE_LEN>,
    pub(crate) rx_buff: Queue<(RxInfo, Bytes), RX_QUEUE_LEN>,
    /// Join responses, slot requests and retransmit requests
    pub(crate) mgmt_out: VecDeque<MacFrame>,
    pub(crate) sent: VecDeque<SentFrame>,
    pub(crate) retx: VecDeque<SentFrame>,
    /// Frames to be sent back to back in the current slot
    burst: VecDeque<Bytes>,
    events: Queue<MacEvent, EVENT_QUEUE_LEN>,

    pub(crate) stats: MacStats,
}

impl <R, S, I, E, T, G> Tdma<R, S, I, E, T, G>
where
    R: Radio<S, I, E> + radio::Channel<Error=E>,
    <R as radio::Channel>::Channel: From<u16>,
    S: radio::RadioState,
    I: radio::ReceiveInfo + Default + Debug,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    /// Create a new TDMA MAC, starting as coordinator or scanning for a network
    pub fn new(address: Address, config: Config, radio: R, timer: T, rng: G, links: Reader<LinkTable>, routes: NextHop) -> Result<Self, CoreError<E>> {
        config.validate()?;

        let now = timer.ticks_us();
        let base = Base::new(radio)?;

        let mut s = Self {
            address,
            base,
            timer,
            rng,

            state: MacState::Scanning,
            network_id: config.network_id,
            coordinator: None,
            schedule: SuperframeSchedule::new(&config),
            admission: Admission::new(config.qos.clone(), config.data_slots(), config.slot_us),
            nodes: NodeTable::new(config.node_timeout_us),
            station_id: StationId::new(config.callsign.clone(), config.id_interval_us, now),

            sync_offset: now,
            last_slot: None,
            last_beacon: now,
            beacon_miss_count: 0,

            channel: 0,
            scan_until: now,
            join: JoinState{ attempt: 0, send_sfn: 0, deadline_sfn: None },

            seq: 0,
            net_seq: 0,

            links,
            routes,

            tx_queues: TxQueues::new(),
            ogm_out: BTreeMap::new(),
            ogm_in: Queue::new(),
            rx_buff: Queue::new(),
            mgmt_out: VecDeque::new(),
            sent: VecDeque::new(),
            retx: VecDeque::new(),
            burst: VecDeque::new(),
            events: Queue::new(),

            stats: MacStats::new(),

            config,
        };

        match s.config.coordinator {
            true => s.coordinate(now)?,
            false => s.scan(now)?,
        }

        Ok(s)
    }

    pub fn state(&self) -> MacState {
        self.state
    }

    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    pub fn schedule(&self) -> &SuperframeSchedule {
        &self.schedule
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn network_id(&self) -> u16 {
        self.network_id
    }

    pub fn coordinator(&self) -> Option<Address> {
        self.coordinator
    }

    pub fn now(&self) -> Ts {
        self.timer.ticks_us()
    }

    /// Fetch the next pending MAC event
    pub fn poll_event(&mut self) -> Option<MacEvent> {
        self.events.dequeue()
    }

    /// Fetch the next received OGM and the neighbour it was heard from
    pub fn poll_ogm(&mut self) -> Option<(Address, Ogm)> {
        self.ogm_in.dequeue()
    }

    /// Queue an OGM for broadcast, replacing any pending OGM from the same originator
    pub fn queue_ogm(&mut self, ogm: Ogm) {
        if let Some(prev) = self.ogm_out.insert(ogm.originator, ogm) {
            trace!("OGM {} from {} superseded by {}", prev.seq, ogm.originator, ogm.seq);
        }
    }

    /// Request data slots for the local node
    ///
    /// The coordinator admits immediately (taking effect at the next
    /// superframe), members send a request in their next owned slot and
    /// receive the outcome as a [`MacEvent`].
    pub fn request_slot(&mut self, class: QosClass, duration_us: u32) -> Result<(), CoreError<E>> {
        match (self.state, self.coordinator) {
            (MacState::Synchronized(SyncRole::Coordinator), _) => {
                let g = self.admission.request_slot(self.address, class, duration_us)?;
                debug!("Coordinator granted itself {} {} slots", g.slots, class);
                Ok(())
            },
            (MacState::Synchronized(SyncRole::Member), Some(coordinator)) => {
                let req = JoinRequest{ class, duration_us, callsign: self.config.callsign.clone() };
                let f = self.management(MgmtKind::JoinRequest, coordinator, req.encode())?;
                self.queue_mgmt(f);
                Ok(())
            },
            _ => Err(CoreError::NoBeacon),
        }
    }

    /// Announce departure to the coordinator and return to scanning
    pub fn leave(&mut self) -> Result<(), CoreError<E>> {
        let coordinator = match (self.state, self.coordinator) {
            (MacState::Synchronized(SyncRole::Member), Some(c)) => c,
            _ => return Err(CoreError::NoBeacon),
        };

        let f = self.management(MgmtKind::Leave, coordinator, Bytes::new())?;
        let now = self.timer.ticks_us();

        // Leave is sent immediately, it does not wait for an owned slot
        self.base.transmit(now, &codec::wrap(Mcs::ROBUST, &f))?;
        self.stats.tx_frames = self.stats.tx_frames.saturating_add(1);

        info!("Leaving network {:04x}", self.network_id);

        self.scan(now)
    }

    /// Start a network as coordinator
    fn coordinate(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        self.state = MacState::Synchronized(SyncRole::Coordinator);
        self.network_id = self.config.network_id;
        self.coordinator = Some(self.address);
        self.sync_offset = now;
        self.last_slot = None;
        self.last_beacon = now;

        self.tune(now)?;

        match self.admission.request_slot(self.address, self.config.join_class, self.config.join_duration_us) {
            Ok(g) => debug!("Coordinator allocated {} {} slots", g.slots, g.class),
            Err(e) => warn!("Coordinator slot allocation denied for {}", e.0),
        }
        self.admission.commit();
        self.schedule = self.schedule.build(self.admission.allocations());

        self.nodes.heard(self.address, now).role = Role::Coordinator;

        info!("Coordinating network {:04x} on channel {}", self.network_id, self.current_channel());

        Ok(())
    }

    /// Drop synchronisation and listen for beacons
    pub(crate) fn scan(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        debug!("Scanning for beacons");

        self.state = MacState::Scanning;
        self.coordinator = None;
        self.last_slot = None;
        self.beacon_miss_count = 0;
        self.join = JoinState{ attempt: 0, send_sfn: 0, deadline_sfn: None };
        self.burst.clear();
        self.mgmt_out.clear();

        self.tune(now)
    }

    fn current_channel(&self) -> u16 {
        self.config.channels[self.channel % self.config.channels.len()]
    }

    fn tune(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        let ch = self.current_channel();
        trace!("Tune to channel {} at {} us", ch, now);

        self.base.set_channel(&ch.into())?;
        self.base.receive(now)?;
        self.scan_until = now + self.config.scan_dwell_us as u64;

        Ok(())
    }

    /// Enter joining after adopting a network from its beacon
    pub(crate) fn start_join(&mut self, now: Ts) {
        self.state = MacState::Joining;
        let sfn = self.config.calculate_sfn(now, self.sync_offset);
        self.join = JoinState{ attempt: 0, send_sfn: sfn + self.backoff(0), deadline_sfn: None };
    }

    /// Join attempt failed or was denied, back off or give up
    pub(crate) fn join_retry(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        self.join.attempt = self.join.attempt.saturating_add(1);
        self.join.deadline_sfn = None;

        if self.join.attempt > self.config.join_retries {
            warn!("Join failed after {} attempts", self.join.attempt);
            self.event(MacEvent::JoinFailed);
            return self.scan(now);
        }

        let sfn = self.config.calculate_sfn(now, self.sync_offset);
        self.join.send_sfn = sfn + 1 + self.backoff(self.join.attempt);

        debug!("Join retry {} in superframe {}", self.join.attempt, self.join.send_sfn);

        Ok(())
    }

    /// Random backoff of 0..2^attempt superframes
    fn backoff(&mut self, attempt: u8) -> u64 {
        let window = 1u64 << attempt.min(16);
        self.rng.next_u32() as u64 % window
    }

    fn next_seq(&mut self) -> SeqCtrl {
        let s = SeqCtrl::new(self.seq);
        self.seq = (self.seq + 1) & SeqCtrl::MAX;
        s
    }

    pub(crate) fn management(&mut self, kind: MgmtKind, receiver: Address, payload: Bytes) -> Result<MacFrame, CoreError<E>> {
        let seq = self.next_seq();
        MacFrame::management(kind, receiver, self.address, self.network_id, seq, payload)
            .map_err(CoreError::Format)
    }

    pub(crate) fn retransmit_request(&mut self, receiver: Address, seq: u16) -> Result<(), CoreError<E>> {
        let s = self.next_seq();
        let f = MacFrame::control(CtrlKind::RetransmitRequest, receiver, self.address, s, RetransmitRequest{ seq }.encode())
            .map_err(CoreError::Format)?;
        self.queue_mgmt(f);
        Ok(())
    }

    pub(crate) fn queue_mgmt(&mut self, frame: MacFrame) {
        if self.mgmt_out.len() >= MGMT_QUEUE_LEN {
            warn!("Management queue full, dropping oldest frame");
            self.mgmt_out.pop_front();
        }
        self.mgmt_out.push_back(frame);
    }

    pub(crate) fn event(&mut self, e: MacEvent) {
        if self.events.len() == self.events.capacity() {
            warn!("Event queue full, dropping oldest event");
            let _ = self.events.dequeue();
        }
        let _ = self.events.enqueue(e);
    }

    /// Retain a unicast frame for retransmission on request
    fn remember(&mut self, s: SentFrame) {
        if self.sent.len() >= ARQ_WINDOW {
            self.sent.pop_front();
        }
        self.sent.push_back(s);
    }

    /// MCS for a neighbour from the link snapshot
    fn link_mcs(&mut self, via: Address) -> Mcs {
        if via.is_broadcast() {
            return Mcs::ROBUST;
        }
        self.links.load().get(&via).map(|l| l.mcs).unwrap_or(Mcs::ROBUST)
    }

    /// Add a frame to the current slot burst if its airtime fits the remaining budget
    fn queue_burst(&mut self, mcs: Mcs, frame: &MacFrame, budget: &mut u32) -> bool {
        let t = airtime_us(mcs, frame.len());
        if t > *budget {
            return false;
        }

        *budget -= t;
        self.burst.push_back(codec::wrap(mcs, frame));
        true
    }

    /// Handle channel hopping while scanning
    fn tick_scan(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        if now >= self.scan_until {
            self.channel = (self.channel + 1) % self.config.channels.len();
            self.tune(now)?;
        }
        Ok(())
    }

    /// Execute slot boundary actions on slot changes
    fn tick_slots(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        let sfn = self.config.calculate_sfn(now, self.sync_offset);
        let rsn = match self.config.calculate_rsn(now, self.sync_offset) {
            Some(r) => r,
            // Idle tail of the superframe
            None => return Ok(()),
        };

        if self.last_slot == Some((sfn, rsn)) {
            return Ok(());
        }

        let new_superframe = self.last_slot.map(|(s, _)| s != sfn).unwrap_or(true);
        self.last_slot = Some((sfn, rsn));

        if !self.burst.is_empty() {
            warn!("Slot ended with {} frames unsent", self.burst.len());
            self.burst.clear();
        }

        if new_superframe {
            self.superframe(now, sfn)?;

            if !matches!(self.state, MacState::Joining | MacState::Synchronized(_)) {
                return Ok(());
            }
        }

        let start = self.config.slot_start(self.sync_offset, sfn, rsn);
        if now > start + self.config.deadline_us as u64 {
            let e = CoreError::<E>::TimingViolation{ expected: start, actual: now };
            warn!("Slot {} deadline exceeded, skipping: {}", rsn, e);
            self.stats.deadline_miss = self.stats.deadline_miss.saturating_add(1);
            return Ok(());
        }

        trace!("Slot {} of superframe {} at {} us", rsn, sfn, now);

        match rsn {
            BEACON_SLOT if self.state.is_coordinator() => self.beacon_slot(now)?,
            CONTENTION_SLOT if self.state == MacState::Joining => self.contention_slot(now, sfn)?,
            _ if self.state.is_synced() => {
                let owned = self.schedule.slot(rsn)
                    .map(|s| s.owner == SlotOwner::Node(self.address))
                    .unwrap_or(false);
                if owned {
                    self.owned_slot(now)?;
                }
            },
            _ => (),
        }

        Ok(())
    }

    /// Superframe boundary maintenance
    fn superframe(&mut self, now: Ts, sfn: u64) -> Result<(), CoreError<E>> {
        match self.state {
            MacState::Synchronized(SyncRole::Coordinator) => {
                self.nodes.heard(self.address, now);

                for a in self.nodes.age(now) {
                    self.admission.release(a);
                    self.event(MacEvent::NodeLost(a));
                }

                if self.admission.commit() {
                    self.schedule = self.schedule.build(self.admission.allocations());
                    info!("Schedule epoch {}: {} slots assigned", self.schedule.epoch, self.schedule.assigned().count());
                } else {
                    self.schedule.advance();
                }
            },
            MacState::Synchronized(SyncRole::Member) | MacState::Joining => {
                let limit = self.config.superframe_duration() + self.config.slot_period();
                if now.saturating_sub(self.last_beacon) > limit {
                    self.beacon_miss_count += 1;
                    debug!("Missed beacon ({} consecutive)", self.beacon_miss_count);
                }

                if self.beacon_miss_count >= self.config.max_beacon_misses {
                    warn!("Exceeded maximum beacon misses, synchronisation lost");
                    self.stats.sync_fail = self.stats.sync_fail.saturating_add(1);
                    self.state = MacState::Degraded;
                    self.burst.clear();
                    self.event(MacEvent::NoBeacon);
                    return Ok(());
                }

                for a in self.nodes.age(now) {
                    self.event(MacEvent::NodeLost(a));
                }

                if self.state == MacState::Joining {
                    if let Some(deadline) = self.join.deadline_sfn {
                        if sfn > deadline {
                            debug!("Join response timeout");
                            self.join_retry(now)?;
                        }
                    }
                }
            },
            _ => (),
        }

        Ok(())
    }

    /// Beacon burst: beacon, identification when due, then join responses
    fn beacon_slot(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        let mut budget = self.config.slot_us;

        let beacon = self.schedule.to_beacon(self.network_id, now);
        let f = self.management(MgmtKind::Beacon, Address::BROADCAST, beacon.encode())?;
        if !self.queue_burst(Mcs::ROBUST, &f, &mut budget) {
            warn!("Beacon exceeds slot airtime");
        }
        self.last_beacon = now;

        self.identification(now, &mut budget)?;

        while let Some(f) = self.mgmt_out.front().cloned() {
            if !self.queue_burst(Mcs::ROBUST, &f, &mut budget) {
                break;
            }
            self.mgmt_out.pop_front();
        }

        Ok(())
    }

    fn identification(&mut self, now: Ts, budget: &mut u32) -> Result<(), CoreError<E>> {
        if !self.station_id.due(now) {
            return Ok(());
        }

        let payload = self.station_id.frame().encode();
        let f = self.management(MgmtKind::Identification, Address::BROADCAST, payload)?;
        if self.queue_burst(Mcs::ROBUST, &f, budget) {
            self.station_id.sent(now);
        }

        Ok(())
    }

    /// Send a join request after clear channel assessment
    fn contention_slot(&mut self, now: Ts, sfn: u64) -> Result<(), CoreError<E>> {
        if self.join.deadline_sfn.is_some() || sfn < self.join.send_sfn {
            return Ok(());
        }

        let coordinator = match self.coordinator {
            Some(c) => c,
            None => return Ok(()),
        };

        let rssi = self.base.rssi()?;
        if rssi > self.config.channel_clear_threshold {
            debug!("Channel busy in contention slot (rssi: {})", rssi);
            self.stats.cca_fail = self.stats.cca_fail.saturating_add(1);
            self.join.send_sfn = sfn + 1 + self.backoff(self.join.attempt);
            return Ok(());
        }

        let req = JoinRequest {
            class: self.config.join_class,
            duration_us: self.config.join_duration_us,
            callsign: self.config.callsign.clone(),
        };
        let f = self.management(MgmtKind::JoinRequest, coordinator, req.encode())?;

        let mut budget = self.config.slot_us;
        self.queue_burst(Mcs::ROBUST, &f, &mut budget);
        self.join.deadline_sfn = Some(sfn + self.config.join_timeout as u64);

        info!("Join request to {} (attempt {})", coordinator, self.join.attempt + 1);

        Ok(())
    }

    /// Owned data slot: identification, management, retransmissions, OGMs
    /// then one frame from the QoS queues
    fn owned_slot(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        let mut budget = self.config.slot_us;

        self.identification(now, &mut budget)?;

        while let Some(f) = self.mgmt_out.front().cloned() {
            if !self.queue_burst(Mcs::ROBUST, &f, &mut budget) {
                break;
            }
            self.mgmt_out.pop_front();
        }

        while let Some(s) = self.retx.front().cloned() {
            let mcs = self.link_mcs(s.frame.header.receiver);
            if !self.queue_burst(mcs, &s.frame, &mut budget) {
                break;
            }
            self.retx.pop_front();
            self.stats.retransmissions = self.stats.retransmissions.saturating_add(1);
            self.remember(s);
        }

        loop {
            let ogm = match self.ogm_out.values().next() {
                Some(o) => *o,
                None => break,
            };

            let seq = self.next_seq();
            let f = MacFrame::data(Address::BROADCAST, self.address, Address::BROADCAST, seq, QosClass::Data, NetworkPacket::ogm(&ogm).encode())
                .map_err(CoreError::Format)?;
            if !self.queue_burst(Mcs::ROBUST, &f, &mut budget) {
                break;
            }
            self.ogm_out.remove(&ogm.originator);
        }

        let o = match self.tx_queues.peek() {
            Some(o) => o.clone(),
            None => return Ok(()),
        };

        let via = match self.routes.next_hop(o.dest, now) {
            Ok(v) => v,
            Err(_) => {
                warn!("No route to {}, dropping {} frame", o.dest, o.class);
                self.tx_queues.dequeue();
                self.stats.tx_fail = self.stats.tx_fail.saturating_add(1);
                self.event(MacEvent::Unreachable(o.dest));
                return Ok(());
            },
        };

        let mcs = self.link_mcs(via);
        let seq = self.next_seq();
        let f = MacFrame::data(via, self.address, o.dest, seq, o.class, o.packet.encode())
            .map_err(CoreError::Format)?;

        if self.queue_burst(mcs, &f, &mut budget) {
            trace!("Sending {} frame to {} via {} at {}", o.class, o.dest, via, mcs.name());
            self.tx_queues.dequeue();
            if !via.is_broadcast() {
                self.remember(SentFrame{ frame: f, retries: 0 });
            }
        }

        Ok(())
    }

    /// Move a sent frame to the retransmission queue, reporting failure once retries are exhausted
    pub(crate) fn retransmit(&mut self, from: Address, seq: u16) {
        let i = match self.sent.iter().position(|s| s.frame.header.receiver == from && s.frame.header.seq.number == seq) {
            Some(i) => i,
            None => {
                debug!("Retransmit request from {} for unknown seq {}", from, seq);
                return;
            },
        };

        let mut s = match self.sent.remove(i) {
            Some(s) => s,
            None => return,
        };

        if s.retries >= self.config.max_retries {
            warn!("Frame {} to {} failed after {} retries", seq, from, s.retries);
            self.stats.tx_fail = self.stats.tx_fail.saturating_add(1);
            self.event(MacEvent::TxFailed{ dest: s.frame.header.address3, seq });
            return;
        }

        s.retries += 1;
        s.frame.header.control.flags.insert(FrameFlags::RETRY);
        debug!("Retransmission {} of frame {} to {}", s.retries, seq, from);
        self.retx.push_back(s);
    }
}

impl <R, S, I, E, T, G> Mac for Tdma<R, S, I, E, T, G>
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
        let seq = self.net_seq;
        self.net_seq = self.net_seq.wrapping_add(1);

        let ttl = self.config.routing.max_hops;
        let packet = match self.config.compress {
            true => NetworkPacket::compressed_data(self.address, ttl, seq, data),
            false => NetworkPacket::data(self.address, ttl, seq, data),
        }.map_err(CoreError::Format)?;

        self.tx_queues.enqueue(Outbound{ dest, class, packet }).map_err(|_| {
            warn!("{} queue full, dropping frame to {}", class, dest);
            CoreError::BufferOverflow
        })
    }

    fn receive(&mut self, buff: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error> {
        match self.rx_buff.peek() {
            Some((_, data)) if data.len() > buff.len() => {
                return Err(CoreError::BufferTooSmall(data.len()));
            },
            Some(_) => (),
            None => return Ok(None),
        }

        let (info, data) = match self.rx_buff.dequeue() {
            Some(v) => v,
            None => return Ok(None),
        };

        let n = data.len();
        buff[..n].copy_from_slice(&data);

        Ok(Some((n, info)))
    }

    fn busy(&mut self) -> Result<bool, Self::Error> {
        Ok(self.base.is_busy() || !self.burst.is_empty() || !self.tx_queues.is_empty())
    }

    fn tick(&mut self) -> Result<(), Self::Error> {
        let now = self.timer.ticks_us();

        if let Some(rx) = self.base.tick(now)? {
            self.handle_received(now, rx)?;
        }

        match self.state {
            MacState::Scanning => self.tick_scan(now)?,
            MacState::Degraded => {
                info!("Degraded, rescanning");
                self.scan(now)?;
            },
            MacState::Joining | MacState::Synchronized(_) => self.tick_slots(now)?,
        }

        if !self.base.is_busy() {
            if let Some(f) = self.burst.pop_front() {
                self.base.transmit(now, &f)?;
                self.stats.tx_frames = self.stats.tx_frames.saturating_add(1);
            }
        }

        Ok(())
    }
}
