//! Superframe slot schedule
//!
//! Slot 0 carries the beacon, slot 1 is the contention (join) slot and the
//! remaining slots are data slots assigned from admitted allocations. The
//! coordinator rebuilds the schedule at a superframe boundary only when the
//! allocation changed, otherwise it is carried forward with the epoch
//! advanced. Members adopt the schedule carried in each beacon.

use log::{trace, warn};

use crate::codec::Malformed;
use crate::codec::mgmt::Beacon;
use crate::config::{Config, BEACON_SLOT, CONTENTION_SLOT};
use crate::node::Address;
use crate::qos::{Allocation, QosClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOwner {
    Beacon,
    Contention,
    Node(Address),
    Free,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub index: u8,
    pub duration_us: u32,
    pub owner: SlotOwner,
    pub class: QosClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuperframeSchedule {
    /// Beacon sequence number this schedule was published with
    pub epoch: u16,
    pub superframe_us: u32,
    pub slot_us: u32,
    pub guard_us: u32,
    slots: Vec<Slot>,
}

impl SuperframeSchedule {
    /// Empty schedule with all data slots free
    pub fn new(config: &Config) -> Self {
        let n = config.slots_per_superframe().min(u8::MAX as u64) as u8;

        Self::with_owners(0, config.superframe_us, config.slot_us, config.guard_us, (0..n).map(|i| match i {
            BEACON_SLOT => (SlotOwner::Beacon, QosClass::Emergency),
            CONTENTION_SLOT => (SlotOwner::Contention, QosClass::Data),
            _ => (SlotOwner::Free, QosClass::Data),
        }))
    }

    fn with_owners(epoch: u16, superframe_us: u32, slot_us: u32, guard_us: u32, owners: impl Iterator<Item=(SlotOwner, QosClass)>) -> Self {
        let slots = owners.enumerate()
            .map(|(i, (owner, class))| Slot{ index: i as u8, duration_us: slot_us, owner, class })
            .collect();

        Self{ epoch, superframe_us, slot_us, guard_us, slots }
    }

    /// Build the next schedule from the committed allocations
    ///
    /// Allocations keep the slot positions they held previously where
    /// possible, remaining slots are assigned in priority then admission order.
    pub fn build(&self, allocations: &[Allocation]) -> Self {
        let mut next = self.clone();
        next.epoch = self.epoch.wrapping_add(1);

        let mut remaining: Vec<_> = allocations.iter()
            .map(|a| (a, a.slots as usize))
            .collect();
        remaining.sort_by_key(|(a, _)| (a.class, a.order));

        for s in next.slots.iter_mut().filter(|s| s.index > CONTENTION_SLOT) {
            let keep = match s.owner {
                SlotOwner::Node(n) => remaining.iter_mut()
                    .find(|(a, r)| a.node == n && a.class == s.class && *r > 0),
                _ => None,
            };

            match keep {
                Some((_, r)) => *r -= 1,
                None => {
                    s.owner = SlotOwner::Free;
                    s.class = QosClass::Data;
                },
            }
        }

        for (a, r) in remaining.iter_mut() {
            while *r > 0 {
                match next.slots.iter_mut().find(|s| s.owner == SlotOwner::Free) {
                    Some(s) => {
                        s.owner = SlotOwner::Node(a.node);
                        s.class = a.class;
                        *r -= 1;
                    },
                    None => {
                        warn!("Schedule full, dropping {} slots for {} ({})", r, a.node, a.class);
                        *r = 0;
                    },
                }
            }
        }

        trace!("Built schedule epoch {}: {} assigned", next.epoch, next.assigned().count());

        next
    }

    /// Carry the schedule forward to the next superframe
    pub fn advance(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: u8) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Data slots currently assigned to a node
    pub fn assigned(&self) -> impl Iterator<Item=&Slot> {
        self.slots.iter().filter(|s| matches!(s.owner, SlotOwner::Node(_)))
    }

    pub fn owned_by(&self, node: Address) -> impl Iterator<Item=&Slot> {
        self.slots.iter().filter(move |s| s.owner == SlotOwner::Node(node))
    }

    /// Total duration of assigned data slots
    pub fn assigned_us(&self) -> u64 {
        self.assigned().map(|s| s.duration_us as u64).sum()
    }

    /// Beacon and contention slots plus guard times
    pub fn overhead_us(&self) -> u64 {
        let fixed: u64 = self.slots.iter()
            .filter(|s| matches!(s.owner, SlotOwner::Beacon | SlotOwner::Contention))
            .map(|s| s.duration_us as u64)
            .sum();

        fixed + self.guard_us as u64 * self.slots.len() as u64
    }

    /// Check the slot layout and that assigned slots fit the superframe
    pub fn validate(&self) -> Result<(), Malformed> {
        if self.slots.len() <= CONTENTION_SLOT as usize {
            return Err(Malformed::Content);
        }

        for (i, s) in self.slots.iter().enumerate() {
            let expected = match i as u8 {
                BEACON_SLOT => s.owner == SlotOwner::Beacon,
                CONTENTION_SLOT => s.owner == SlotOwner::Contention,
                _ => !matches!(s.owner, SlotOwner::Beacon | SlotOwner::Contention),
            };
            if s.index as usize != i || !expected {
                return Err(Malformed::Content);
            }
        }

        if self.assigned_us() + self.overhead_us() > self.superframe_us as u64 {
            return Err(Malformed::Content);
        }

        Ok(())
    }

    /// Beacon advertising this schedule
    pub fn to_beacon(&self, network_id: u16, timestamp_us: u64) -> Beacon {
        Beacon {
            network_id,
            epoch: self.epoch,
            timestamp_us,
            slot_us: self.slot_us,
            guard_us: self.guard_us.min(u16::MAX as u32) as u16,
            slots: self.slots.iter().map(|s| (s.owner, s.class)).collect(),
        }
    }

    /// Schedule advertised by a received beacon
    pub fn from_beacon(beacon: &Beacon, superframe_us: u32) -> Result<Self, Malformed> {
        let s = Self::with_owners(beacon.epoch, superframe_us, beacon.slot_us, beacon.guard_us as u32, beacon.slots.iter().copied());
        s.validate()?;
        Ok(s)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::qos::{Admission, QosConfig};

    fn alloc(node: u64, class: QosClass, slots: u8, order: u64) -> Allocation {
        Allocation{ node: Address(node), class, slots, order }
    }

    #[test]
    fn default_layout() {
        let s = SuperframeSchedule::new(&Config::default());

        assert_eq!(s.len(), 19);
        assert_eq!(s.slot(0).map(|s| s.owner), Some(SlotOwner::Beacon));
        assert_eq!(s.slot(1).map(|s| s.owner), Some(SlotOwner::Contention));
        assert_eq!(s.assigned().count(), 0);
        assert_eq!(s.overhead_us(), 2 * 5_000 + 19 * 100);
        assert_eq!(s.validate(), Ok(()));
    }

    #[test]
    fn build_priority_order() {
        let s = SuperframeSchedule::new(&Config::default());

        let n = s.build(&[
            alloc(0xb, QosClass::Data, 2, 1),
            alloc(0xa, QosClass::Emergency, 1, 2),
        ]);

        assert_eq!(n.epoch, 1);
        assert_eq!(n.slot(2).map(|s| (s.owner, s.class)), Some((SlotOwner::Node(Address(0xa)), QosClass::Emergency)));
        assert_eq!(n.owned_by(Address(0xb)).map(|s| s.index).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(n.validate(), Ok(()));
    }

    #[test]
    fn build_keeps_positions() {
        let s = SuperframeSchedule::new(&Config::default());
        let n = s.build(&[
            alloc(0xb, QosClass::Data, 1, 1),
            alloc(0xc, QosClass::Data, 1, 2),
        ]);
        assert_eq!(n.owned_by(Address(0xc)).next().map(|s| s.index), Some(3));

        // A new higher priority allocation takes a free slot, not an existing one
        let n = n.build(&[
            alloc(0xc, QosClass::Data, 1, 2),
            alloc(0xa, QosClass::Voice, 1, 3),
        ]);
        assert_eq!(n.owned_by(Address(0xc)).next().map(|s| s.index), Some(3));
        assert_eq!(n.owned_by(Address(0xa)).next().map(|s| s.index), Some(2));
        assert_eq!(n.owned_by(Address(0xb)).count(), 0);
    }

    #[test]
    fn beacon_schedule() {
        let s = SuperframeSchedule::new(&Config::default())
            .build(&[alloc(0xa, QosClass::Video, 3, 1)]);

        let b = s.to_beacon(0x0100, 42);
        assert_eq!(b.slots.len(), 19);
        assert_eq!(SuperframeSchedule::from_beacon(&b, 100_000), Ok(s));

        let mut bad = b.clone();
        bad.slots[1].0 = SlotOwner::Free;
        assert_eq!(SuperframeSchedule::from_beacon(&bad, 100_000), Err(Malformed::Content));

        // Does not fit a shorter superframe
        assert_eq!(SuperframeSchedule::from_beacon(&b, 20_000), Err(Malformed::Content));
    }

    proptest! {
        /// Any admitted allocation set fits the superframe
        #[test]
        fn schedule_fits(
            slot_us in 500u32..20_000,
            guard_us in 0u32..1_000,
            superframe_us in 10_000u32..400_000,
            requests in prop::collection::vec((1u64..16, 0u8..4, 1u32..40_000), 0..32),
        ) {
            let config = Config{ superframe_us, beacon_interval_us: superframe_us, slot_us, guard_us, ..Default::default() };
            prop_assume!(config.validate().is_ok());

            let mut admission = Admission::new(QosConfig::default(), config.data_slots(), slot_us);
            let mut s = SuperframeSchedule::new(&config);

            for (node, class, duration) in requests {
                let class = QosClass::try_from(class).unwrap();
                let _ = admission.request_slot(Address(node), class, duration);

                if admission.commit() {
                    s = s.build(admission.allocations());
                }

                prop_assert_eq!(s.validate(), Ok(()));
                prop_assert_eq!(s.assigned().count(), admission.allocations().iter().map(|a| a.slots as usize).sum::<usize>());
            }
        }
    }
}
