//! Received frame handling for the TDMA MAC

use core::fmt::Debug;

use log::{trace, debug, info, warn};
use rand_core::RngCore;

use crate::{Radio, RawPacket, Ts, timer::Timer, error::CoreError};
use crate::codec::{self, DecodeError, FrameType, MacFrame, MgmtKind, CtrlKind, NetworkPacket, PacketType};
use crate::codec::mgmt::{Beacon, JoinRequest, JoinResponse, JoinStatus, Identification, RetransmitRequest};
use crate::node::Role;
use crate::qos::{Outbound, QosClass};
use crate::schedule::SuperframeSchedule;

use super::{MacEvent, MacState, RxInfo, SyncRole, Tdma};

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
    pub(crate) fn handle_received(&mut self, now: Ts, rx: RawPacket) -> Result<(), CoreError<E>> {
        let frame = match codec::unwrap(rx.data()) {
            Ok((_mcs, f)) => f,
            Err(DecodeError::ChecksumFailure(c)) => {
                self.stats.crc_fail = self.stats.crc_fail.saturating_add(1);
                debug!("{:?} checksum failure on {} byte frame", c, rx.data().len());

                // Request a retransmission if the header survived and the frame was ours
                if let Some((receiver, transmitter, seq)) = codec::peek_header(rx.data()) {
                    if receiver == self.address && self.state.is_synced() {
                        self.retransmit_request(transmitter, seq.number)?;
                    }
                }
                return Ok(());
            },
            Err(DecodeError::Malformed(m)) => {
                self.stats.malformed = self.stats.malformed.saturating_add(1);
                debug!("Dropped malformed frame: {}", m);
                return Ok(());
            },
        };

        self.stats.rx_frames = self.stats.rx_frames.saturating_add(1);

        let h = frame.header;
        trace!("Received {:?} from {} (seq: {})", h.control.kind, h.transmitter, h.seq.number);

        if h.receiver != self.address && !h.receiver.is_broadcast() {
            trace!("Address mismatch, dropped frame {} for {}", h.seq.number, h.receiver);
            return Ok(());
        }

        // Only beacons are of interest until a network is found
        let scanning = matches!(self.state, MacState::Scanning | MacState::Degraded);
        match (scanning, h.control.kind) {
            (true, FrameType::Management(MgmtKind::Beacon)) => (),
            (true, _) => return Ok(()),
            (false, FrameType::Management(_)) if frame.network_id() != self.network_id => {
                debug!("Network mismatch, dropped frame {} for {:04x}", h.seq.number, frame.network_id());
                return Ok(());
            },
            _ => {
                self.nodes.heard(h.transmitter, now);
            },
        }

        match h.control.kind {
            FrameType::Management(MgmtKind::Beacon) => self.handle_beacon(now, &frame),
            FrameType::Management(MgmtKind::JoinRequest) => self.handle_join_request(now, &frame),
            FrameType::Management(MgmtKind::JoinResponse) => self.handle_join_response(now, &frame),
            FrameType::Management(MgmtKind::Identification) => {
                match Identification::decode(frame.payload()) {
                    Ok(id) => {
                        debug!("Identified {} as {}", h.transmitter, id.callsign);
                        self.nodes.heard(h.transmitter, now).callsign = Some(id.callsign);
                    },
                    Err(e) => self.malformed(e),
                }
                Ok(())
            },
            FrameType::Management(MgmtKind::Leave) => {
                if self.state.is_coordinator() {
                    info!("Node {} left the network", h.transmitter);
                    self.admission.release(h.transmitter);
                    self.nodes.remove(&h.transmitter);
                    self.event(MacEvent::NodeLost(h.transmitter));
                }
                Ok(())
            },
            FrameType::Control(CtrlKind::RetransmitRequest) => {
                match RetransmitRequest::decode(frame.payload()) {
                    Ok(r) => self.retransmit(h.transmitter, r.seq),
                    Err(e) => self.malformed(e),
                }
                Ok(())
            },
            FrameType::Data(class) => self.handle_data(rx.rssi(), class, &frame),
        }
    }

    fn malformed(&mut self, e: codec::Malformed) {
        self.stats.malformed = self.stats.malformed.saturating_add(1);
        debug!("Dropped malformed payload: {}", e);
    }

    fn handle_beacon(&mut self, now: Ts, frame: &MacFrame) -> Result<(), CoreError<E>> {
        let transmitter = frame.header.transmitter;

        let beacon = match Beacon::decode(frame.payload()) {
            Ok(b) => b,
            Err(e) => {
                self.malformed(e);
                return Ok(());
            },
        };

        let schedule = match SuperframeSchedule::from_beacon(&beacon, self.config.superframe_us) {
            Ok(s) => s,
            Err(e) => {
                warn!("Beacon from {} carries an invalid schedule: {}", transmitter, e);
                self.malformed(e);
                return Ok(());
            },
        };

        if self.state.is_coordinator() {
            debug!("Ignoring beacon from {} on network {:04x}", transmitter, beacon.network_id);
            return Ok(());
        }
        if matches!(self.state, MacState::Joining | MacState::Synchronized(_)) && Some(transmitter) != self.coordinator {
            debug!("Ignoring beacon from {}, not our coordinator", transmitter);
            return Ok(());
        }

        let retimed = match self.adopt_timing(&beacon, schedule.len()) {
            Ok(r) => r,
            Err(e) => {
                warn!("Beacon from {} timing does not fit the superframe", transmitter);
                self.malformed(e);
                return Ok(());
            },
        };

        match self.state {
            MacState::Synchronized(SyncRole::Coordinator) => (),
            MacState::Scanning | MacState::Degraded => {
                info!("Found network {:04x} coordinated by {} (epoch {})", beacon.network_id, transmitter, beacon.epoch);

                self.network_id = beacon.network_id;
                self.coordinator = Some(transmitter);
                self.schedule = schedule;

                // Hard set the superframe timing on first sync
                self.sync_offset = now;
                self.last_slot = None;
                self.last_beacon = now;
                self.beacon_miss_count = 0;

                let n = self.nodes.heard(transmitter, now);
                n.role = Role::Coordinator;
                n.clock_offset = beacon.timestamp_us as i64 - now as i64;

                self.start_join(now);
            },
            MacState::Joining | MacState::Synchronized(SyncRole::Member) if retimed => {
                warn!("Coordinator {} changed slot timing, resynchronising", transmitter);

                self.schedule = schedule;
                self.sync_offset = now;
                self.last_slot = None;
                self.last_beacon = now;
                self.beacon_miss_count = 0;
            },
            MacState::Joining | MacState::Synchronized(SyncRole::Member) => {
                let superframe = self.config.superframe_duration() as i64;
                let mut delta = (now.saturating_sub(self.sync_offset) as i64) % superframe;
                if delta > superframe / 2 {
                    delta -= superframe;
                }

                if delta.abs() > superframe / 10 {
                    warn!("Beacon offset {} us exceeds tolerance, resynchronising", delta);
                    self.sync_offset = now;
                    self.last_slot = None;
                } else {
                    self.sync_offset = (self.sync_offset as i64 + delta / 2) as u64;
                }

                trace!("Beacon epoch {} at {} us (error: {} us)", beacon.epoch, now, delta);

                self.schedule = schedule;
                self.last_beacon = now;
                self.beacon_miss_count = 0;

                let n = self.nodes.heard(transmitter, now);
                n.role = Role::Coordinator;
                n.clock_offset = beacon.timestamp_us as i64 - now as i64;
            },
        }

        Ok(())
    }

    /// Take the slot timing advertised in a beacon, returning whether it
    /// differed from the timing in use
    fn adopt_timing(&mut self, beacon: &Beacon, slots: usize) -> Result<bool, codec::Malformed> {
        let period = beacon.slot_us as u64 + beacon.guard_us as u64;
        if beacon.slot_us == 0 || self.config.superframe_duration() / period != slots as u64 {
            return Err(codec::Malformed::Content);
        }

        if beacon.slot_us == self.config.slot_us && beacon.guard_us as u32 == self.config.guard_us {
            return Ok(false);
        }

        info!("Adopting slot timing {} us + {} us guard (was {} us + {} us)",
                beacon.slot_us, beacon.guard_us, self.config.slot_us, self.config.guard_us);

        self.config.slot_us = beacon.slot_us;
        self.config.guard_us = beacon.guard_us as u32;

        Ok(true)
    }

    fn handle_join_request(&mut self, now: Ts, frame: &MacFrame) -> Result<(), CoreError<E>> {
        if !self.state.is_coordinator() || frame.header.receiver != self.address {
            return Ok(());
        }

        let src = frame.header.transmitter;
        let req = match JoinRequest::decode(frame.payload()) {
            Ok(r) => r,
            Err(e) => {
                self.malformed(e);
                return Ok(());
            },
        };

        debug!("Join request from {} ({}) for {} us of {}", src, req.callsign, req.duration_us, req.class);

        let was_member = {
            let n = self.nodes.heard(src, now);
            n.callsign = Some(req.callsign.clone());
            n.role == Role::Member
        };

        let resp = match self.admission.request_slot(src, req.class, req.duration_us) {
            Ok(g) => {
                for (n, c) in &g.preempted {
                    debug!("{} ({}) preempted by {}", n, c, src);
                }

                if !was_member {
                    info!("Admitted {} ({}) with {} {} slots", src, req.callsign, g.slots, g.class);
                    self.nodes.heard(src, now).role = Role::Member;
                    self.event(MacEvent::NodeJoined(src));
                }

                JoinResponse{ status: JoinStatus::Granted, class: req.class, slots: g.slots }
            },
            Err(d) => {
                info!("Denied {} slots for {}", d.0, src);
                JoinResponse{ status: JoinStatus::Denied, class: req.class, slots: 0 }
            },
        };

        let f = self.management(MgmtKind::JoinResponse, src, resp.encode())?;
        self.queue_mgmt(f);

        Ok(())
    }

    fn handle_join_response(&mut self, now: Ts, frame: &MacFrame) -> Result<(), CoreError<E>> {
        let src = frame.header.transmitter;
        if frame.header.receiver != self.address || Some(src) != self.coordinator {
            return Ok(());
        }

        let resp = match JoinResponse::decode(frame.payload()) {
            Ok(r) => r,
            Err(e) => {
                self.malformed(e);
                return Ok(());
            },
        };

        match (self.state, resp.status) {
            (MacState::Joining, JoinStatus::Granted) => {
                info!("Joined network {:04x} via {} with {} slots", self.network_id, src, resp.slots);
                self.state = MacState::Synchronized(SyncRole::Member);
                self.join.deadline_sfn = None;
                self.event(MacEvent::Joined{ coordinator: src, slots: resp.slots });
            },
            (MacState::Joining, JoinStatus::Denied) => {
                warn!("Join denied by {} for {}", src, resp.class);
                self.event(MacEvent::JoinDenied(resp.class));
                self.join_retry(now)?;
            },
            (MacState::Synchronized(SyncRole::Member), JoinStatus::Granted) => {
                debug!("Granted {} {} slots", resp.slots, resp.class);
                self.event(MacEvent::SlotGranted{ class: resp.class, slots: resp.slots });
            },
            (MacState::Synchronized(SyncRole::Member), JoinStatus::Denied) => {
                debug!("Denied {} slots", resp.class);
                self.event(MacEvent::SlotDenied(resp.class));
            },
            _ => (),
        }

        Ok(())
    }

    fn handle_data(&mut self, rssi: i16, class: QosClass, frame: &MacFrame) -> Result<(), CoreError<E>> {
        let h = frame.header;

        let packet = match NetworkPacket::decode(frame.payload()) {
            Ok(p) => p,
            Err(e) => {
                self.stats.malformed = self.stats.malformed.saturating_add(1);
                debug!("Dropped data frame {} from {}: {}", h.seq.number, h.transmitter, e);
                return Ok(());
            },
        };

        if packet.header.kind == PacketType::Ogm {
            match packet.as_ogm() {
                Ok(ogm) => if self.ogm_in.enqueue((h.transmitter, ogm)).is_err() {
                    warn!("OGM inbox full, dropped OGM from {}", ogm.originator);
                    self.stats.rx_overflow = self.stats.rx_overflow.saturating_add(1);
                },
                Err(e) => self.malformed(e),
            }
            return Ok(());
        }

        let dest = h.address3;

        // Forward packets for other destinations
        if dest != self.address && !dest.is_broadcast() {
            match packet.forwarded() {
                Some(p) => {
                    trace!("Forwarding {} packet for {} from {}", class, dest, h.transmitter);
                    if self.tx_queues.enqueue(Outbound{ dest, class, packet: p }).is_err() {
                        warn!("{} queue full, dropped forwarded packet for {}", class, dest);
                        self.stats.rx_overflow = self.stats.rx_overflow.saturating_add(1);
                    }
                },
                None => debug!("TTL expired, dropped packet for {}", dest),
            }
            return Ok(());
        }

        let (source, data) = match packet.user_data() {
            Ok(v) => v,
            Err(e) => {
                self.malformed(e);
                return Ok(());
            },
        };

        if source == self.address {
            return Ok(());
        }

        let info = RxInfo{ source, via: h.transmitter, rssi, class };
        if self.rx_buff.enqueue((info, data)).is_err() {
            warn!("RX buffer full, dropped packet from {}", source);
            self.stats.rx_overflow = self.stats.rx_overflow.saturating_add(1);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use radio::{Channel, Transmit};

    use super::*;
    use crate::amc::Mcs;
    use crate::codec::{SeqCtrl, Ogm};
    use crate::mac::Mac;
    use crate::mac::tdma::test::*;
    use crate::node::Address;
    use crate::sim::SimMedium;
    use crate::timer::mock::MockTimer;

    /// Flush the coordinator's beacon burst and idle in an unowned slot
    fn quiet(node: &mut TestNode, timer: &mut MockTimer) {
        for _ in 0..4 {
            node.mac.tick().unwrap();
        }
        timer.set_us(node.mac.config.slot_start(0, 0, 3) + 100);
        node.mac.tick().unwrap();
    }

    /// Deliver a frame to the node's radio through the medium
    fn inject(medium: &SimMedium, node: &TestNode, frame: &MacFrame, corrupt: bool) {
        let mut tx = medium.radio();
        tx.set_channel(&node.mac.config.channels[0]).unwrap();
        medium.connect(&tx, &node.radio, -70);
        if corrupt {
            medium.corrupt_next(&tx);
        }

        tx.start_transmit(&codec::wrap(Mcs::ROBUST, frame)).unwrap();
        medium.disconnect(&tx, &node.radio);
    }

    fn data(receiver: u64, transmitter: u64, dest: u64, origin: u64, ttl: u8) -> MacFrame {
        let p = NetworkPacket::data(Address(origin), ttl, 7, &[0xde, 0xad]).unwrap();
        MacFrame::data(Address(receiver), Address(transmitter), Address(dest), SeqCtrl::new(42), QosClass::Video, p.encode()).unwrap()
    }

    #[test]
    fn deliver_and_forward() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let medium = SimMedium::new();
        let mut timer = MockTimer::new();
        let mut c = node(0xc, true, &medium, &timer);
        quiet(&mut c, &mut timer);

        // Local delivery
        inject(&medium, &c, &data(0xc, 0xa, 0xc, 0xb, 32), false);
        c.mac.tick().unwrap();

        let mut buff = [0u8; 16];
        let (n, info) = c.mac.receive(&mut buff).unwrap().unwrap();
        assert_eq!(&buff[..n], &[0xde, 0xad]);
        assert_eq!(info, RxInfo{ source: Address(0xb), via: Address(0xa), rssi: -70, class: QosClass::Video });
        assert!(c.mac.nodes().get(&Address(0xa)).is_some());

        // Forwarded with decremented TTL
        inject(&medium, &c, &data(0xc, 0xa, 0xd, 0xb, 32), false);
        c.mac.tick().unwrap();
        assert!(c.mac.receive(&mut buff).unwrap().is_none());
        let o = c.mac.tx_queues.dequeue().unwrap();
        assert_eq!((o.dest, o.class, o.packet.header.ttl), (Address(0xd), QosClass::Video, 31));

        // Expired TTL is not forwarded
        inject(&medium, &c, &data(0xc, 0xa, 0xd, 0xb, 1), false);
        c.mac.tick().unwrap();
        assert!(c.mac.tx_queues.is_empty());

        // Frames for other receivers are ignored
        inject(&medium, &c, &data(0xe, 0xa, 0xc, 0xb, 32), false);
        c.mac.tick().unwrap();
        assert!(c.mac.receive(&mut buff).unwrap().is_none());
    }

    #[test]
    fn ogm_inbox() {
        let medium = SimMedium::new();
        let mut timer = MockTimer::new();
        let mut c = node(0xc, true, &medium, &timer);
        quiet(&mut c, &mut timer);

        let ogm = Ogm{ originator: Address(0xb), seq: 3, ttl: 31, metric: 0.5, prev_hop: Address(0xb) };
        let f = MacFrame::data(Address::BROADCAST, Address(0xa), Address::BROADCAST, SeqCtrl::new(1), QosClass::Data, NetworkPacket::ogm(&ogm).encode()).unwrap();

        inject(&medium, &c, &f, false);
        c.mac.tick().unwrap();

        assert_eq!(c.mac.poll_ogm(), Some((Address(0xa), ogm)));
        assert_eq!(c.mac.poll_ogm(), None);
    }

    #[test]
    fn checksum_failure_requests_retransmit() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let medium = SimMedium::new();
        let mut timer = MockTimer::new();
        let mut c = node(0xc, true, &medium, &timer);
        quiet(&mut c, &mut timer);
        c.mac.mgmt_out.clear();

        inject(&medium, &c, &data(0xc, 0xa, 0xc, 0xa, 32), true);
        c.mac.tick().unwrap();

        assert_eq!(c.mac.stats().crc_fail, 1);
        assert_eq!(c.mac.stats().rx_frames, 0);

        let req = c.mac.mgmt_out.pop_front().unwrap();
        assert_eq!(req.header.control.kind, FrameType::Control(CtrlKind::RetransmitRequest));
        assert_eq!(req.header.receiver, Address(0xa));
        assert_eq!(RetransmitRequest::decode(req.payload()).unwrap().seq, 42);

        // Frames for other nodes are not requested again
        inject(&medium, &c, &data(0xe, 0xa, 0xe, 0xa, 32), true);
        c.mac.tick().unwrap();
        assert_eq!(c.mac.stats().crc_fail, 2);
        assert!(c.mac.mgmt_out.is_empty());
    }

    #[test]
    fn network_filter() {
        let medium = SimMedium::new();
        let mut timer = MockTimer::new();
        let mut c = node(0xc, true, &medium, &timer);
        quiet(&mut c, &mut timer);

        let f = MacFrame::management(MgmtKind::Identification, Address::BROADCAST, Address(0xa), 0x0200, SeqCtrl::new(1), Identification{ callsign: "OTHER".parse().unwrap() }.encode()).unwrap();
        inject(&medium, &c, &f, false);
        c.mac.tick().unwrap();
        assert!(c.mac.nodes().get(&Address(0xa)).is_none());

        let f = MacFrame::management(MgmtKind::Identification, Address::BROADCAST, Address(0xa), 0x0100, SeqCtrl::new(2), Identification{ callsign: "LOCAL".parse().unwrap() }.encode()).unwrap();
        inject(&medium, &c, &f, false);
        c.mac.tick().unwrap();
        assert_eq!(c.mac.nodes().get(&Address(0xa)).and_then(|n| n.callsign.as_ref()).map(|c| c.as_str()), Some("LOCAL"));
    }

    #[test]
    fn leave_releases_slots() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let medium = SimMedium::new();
        let mut timer = MockTimer::new();
        let mut c = node(0xc, true, &medium, &timer);
        let mut m = node(0xa, false, &medium, &timer);
        medium.connect(&c.radio, &m.radio, -60);

        run(&mut [&mut c.mac, &mut m.mac], &mut timer, 300_000);
        assert!(m.mac.state().is_synced());
        while c.mac.poll_event().is_some() {}

        m.mac.leave().unwrap();
        assert_eq!(m.mac.state(), MacState::Scanning);

        run(&mut [&mut c.mac, &mut m.mac], &mut timer, 1_000);
        assert_eq!(c.mac.poll_event(), Some(MacEvent::NodeLost(Address(0xa))));

        run(&mut [&mut c.mac], &mut timer, 100_000);
        assert_eq!(c.mac.schedule().owned_by(Address(0xa)).count(), 0);
    }
}
