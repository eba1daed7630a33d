//! QoS admission control
//!
//! Traffic classes hold nested slot ceilings derived from their guarantee
//! fractions. Requests are granted from free capacity first, and non
//! best-effort classes may preempt strictly lower classes. All changes take
//! effect at the next superframe boundary ([`Admission::commit`]), so no
//! grant is revoked mid-superframe.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{debug, info, warn};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::codec::NetworkPacket;
use crate::error::ConfigError;
use crate::node::Address;

/// Traffic classes in strict priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum QosClass {
    Emergency = 0,
    Voice = 1,
    Video = 2,
    Data = 3,
}

impl QosClass {
    /// Best-effort classes never preempt and hold no guarantee
    pub fn is_best_effort(&self) -> bool {
        *self == QosClass::Data
    }
}

/// Application services and the class each is carried in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ServiceType {
    /// Chat, voice and video to a single destination
    Realtime,
    /// File transfer, split into best-effort chunks
    Bulk,
    /// Network-wide alert at the highest priority
    EmergencyBroadcast,
}

impl ServiceType {
    pub fn class(&self) -> QosClass {
        match self {
            ServiceType::Realtime => QosClass::Voice,
            ServiceType::Bulk => QosClass::Data,
            ServiceType::EmergencyBroadcast => QosClass::Emergency,
        }
    }
}

impl TryFrom<u8> for QosClass {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        QosClass::iter().nth(v as usize).ok_or(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QosConfig {
    /// Enable class guarantees and preemption, otherwise first-come first-served
    pub enabled: bool,
    /// Minimum slot guarantee fraction per class, indexed by class
    pub guarantees: [f32; 4],
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            guarantees: [1.0, 0.8, 0.6, 0.0],
        }
    }
}

impl QosConfig {
    pub fn guarantee(&self, class: QosClass) -> f32 {
        self.guarantees[class as usize]
    }

    /// Guarantees must lie in [0, 1], not increase with falling priority and
    /// their exclusive shares must fit the capacity
    pub fn validate(&self) -> Result<(), ConfigError> {
        for c in QosClass::iter() {
            let g = self.guarantee(c);
            if g.is_nan() || !(0.0..=1.0).contains(&g) {
                return Err(ConfigError::Guarantee(c));
            }
        }

        for (a, b) in QosClass::iter().zip(QosClass::iter().skip(1)) {
            if self.guarantee(b) > self.guarantee(a) {
                return Err(ConfigError::GuaranteeOrder(b));
            }
        }

        if self.guarantee(QosClass::Data) != 0.0 {
            return Err(ConfigError::BestEffortGuarantee);
        }

        // Exclusive shares telescope to the top guarantee
        let shares: f32 = QosClass::iter().zip(QosClass::iter().skip(1))
            .map(|(a, b)| self.guarantee(a) - self.guarantee(b))
            .sum();
        if shares > 1.0 + f32::EPSILON {
            return Err(ConfigError::GuaranteeOverflow);
        }

        Ok(())
    }
}

/// Admitted slot allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub node: Address,
    pub class: QosClass,
    /// Slots per superframe
    pub slots: u8,
    /// Admission order, later allocations are preempted first
    pub order: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub node: Address,
    pub class: QosClass,
    pub slots: u8,
    /// Allocations released at the next boundary to make room for this grant
    pub preempted: Vec<(Address, QosClass)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Denied(pub QosClass);

impl <E> From<Denied> for crate::error::CoreError<E> {
    fn from(d: Denied) -> Self {
        crate::error::CoreError::AdmissionDenied(d.0)
    }
}

/// Slot admission controller, owned by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    config: QosConfig,
    capacity: u8,
    slot_us: u32,
    order: u64,

    /// Allocations in effect this superframe
    active: Vec<Allocation>,
    /// Grants taking effect at the next boundary
    pending: Vec<Allocation>,
    /// Allocations released at the next boundary
    evict: Vec<(Address, QosClass)>,
}

impl Admission {
    /// Create a controller for `capacity` data slots of `slot_us` each
    pub fn new(config: QosConfig, capacity: u8, slot_us: u32) -> Self {
        Self {
            config,
            capacity,
            slot_us,
            order: 0,
            active: vec![],
            pending: vec![],
            evict: vec![],
        }
    }

    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// Allocations in effect for the current superframe
    pub fn allocations(&self) -> &[Allocation] {
        &self.active
    }

    /// Allocations as they will stand after the next commit
    fn effective(&self) -> impl Iterator<Item=&Allocation> {
        self.active.iter()
            .filter(move |a| !self.evict.contains(&(a.node, a.class)))
            .filter(move |a| !self.pending.iter().any(|p| p.node == a.node && p.class == a.class))
            .chain(self.pending.iter())
    }

    fn allocated(&self) -> u32 {
        self.effective().map(|a| a.slots as u32).sum()
    }

    /// Slots held by a class after the next commit
    pub fn held(&self, class: QosClass) -> u32 {
        self.effective().filter(|a| a.class == class).map(|a| a.slots as u32).sum()
    }

    /// Slot ceiling for a class
    pub fn ceiling(&self, class: QosClass) -> u32 {
        match self.config.enabled && !class.is_best_effort() {
            true => (self.config.guarantee(class) * self.capacity as f32).floor() as u32,
            false => self.capacity as u32,
        }
    }

    /// Request slots for `duration_us` per superframe, returning immediately
    pub fn request_slot(&mut self, node: Address, class: QosClass, duration_us: u32) -> Result<Grant, Denied> {
        let slot_us = self.slot_us.max(1) as u64;
        let slots = ((duration_us as u64 + slot_us - 1) / slot_us).max(1) as u32;

        // Repeated requests are idempotent, larger ones replace the current allocation
        let current = self.effective()
            .find(|a| a.node == node && a.class == class)
            .map(|a| a.slots as u32)
            .unwrap_or(0);
        if current >= slots {
            return Ok(Grant{ node, class, slots: current as u8, preempted: vec![] });
        }

        if slots > u8::MAX as u32 || self.held(class) - current + slots > self.ceiling(class) {
            debug!("Deny {} slots for {} ({}): class ceiling", slots, node, class);
            return Err(Denied(class));
        }

        let free = (self.capacity as u32).saturating_sub(self.allocated() - current);
        let mut preempted = vec![];

        if slots > free {
            if !self.config.enabled || class.is_best_effort() {
                debug!("Deny {} slots for {} ({}): no free capacity", slots, node, class);
                return Err(Denied(class));
            }

            // Victims from strictly lower classes, lowest class and latest admission first
            let mut victims: Vec<_> = self.effective()
                .filter(|a| a.class > class)
                .map(|a| (a.class, a.order, a.node, a.slots))
                .collect();
            victims.sort_by(|a, b| b.cmp(a));

            let mut freed = free;
            for (c, _o, n, s) in victims {
                if freed >= slots {
                    break;
                }
                preempted.push((n, c));
                freed += s as u32;
            }

            if freed < slots {
                debug!("Deny {} slots for {} ({}): insufficient preemptable capacity", slots, node, class);
                return Err(Denied(class));
            }

            for (n, c) in &preempted {
                warn!("Preempting {} ({}) for {} ({}) at next superframe", n, c, node, class);
                self.release_one(*n, *c);
            }
        }

        self.order += 1;
        self.pending.retain(|a| !(a.node == node && a.class == class));
        self.pending.push(Allocation{ node, class, slots: slots as u8, order: self.order });

        info!("Granted {} slots to {} ({})", slots, node, class);

        Ok(Grant{ node, class, slots: slots as u8, preempted })
    }

    fn release_one(&mut self, node: Address, class: QosClass) {
        self.pending.retain(|a| !(a.node == node && a.class == class));
        if self.active.iter().any(|a| a.node == node && a.class == class) && !self.evict.contains(&(node, class)) {
            self.evict.push((node, class));
        }
    }

    /// Release all allocations for a node at the next boundary
    pub fn release(&mut self, node: Address) {
        for c in QosClass::iter() {
            self.release_one(node, c);
        }
    }

    /// Apply pending changes at a superframe boundary, returning whether the
    /// allocation changed
    pub fn commit(&mut self) -> bool {
        if self.pending.is_empty() && self.evict.is_empty() {
            return false;
        }

        let evict = core::mem::take(&mut self.evict);
        self.active.retain(|a| !evict.contains(&(a.node, a.class)));

        // Replace smaller allocations superseded by a larger request
        for p in self.pending.drain(..) {
            self.active.retain(|a| !(a.node == p.node && a.class == p.class));
            self.active.push(p);
        }

        debug!("Committed {} allocations", self.active.len());

        true
    }
}

/// Frame awaiting transmission in an owned slot
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Final destination
    pub dest: Address,
    pub class: QosClass,
    pub packet: NetworkPacket,
}

/// Per-class queue depth (the queue holds N - 1 frames)
pub const QUEUE_LEN: usize = 17;

/// Bounded per-class outbound queues served in strict priority
pub struct TxQueues {
    queues: [heapless::spsc::Queue<Outbound, QUEUE_LEN>; 4],
}

impl Default for TxQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl TxQueues {
    pub fn new() -> Self {
        Self {
            queues: [
                heapless::spsc::Queue::new(),
                heapless::spsc::Queue::new(),
                heapless::spsc::Queue::new(),
                heapless::spsc::Queue::new(),
            ],
        }
    }

    /// Enqueue a frame, returning it if its class queue is full
    pub fn enqueue(&mut self, o: Outbound) -> Result<(), Outbound> {
        self.queues[o.class as usize].enqueue(o)
    }

    /// Highest priority pending frame
    pub fn peek(&self) -> Option<&Outbound> {
        self.queues.iter().find_map(|q| q.peek())
    }

    pub fn dequeue(&mut self) -> Option<Outbound> {
        self.queues.iter_mut().find_map(|q| q.dequeue())
    }

    pub fn len(&self, class: QosClass) -> usize {
        self.queues[class as usize].len()
    }

    /// Frames that can still be queued for a class
    pub fn free(&self, class: QosClass) -> usize {
        let q = &self.queues[class as usize];
        q.capacity() - q.len()
    }

    pub fn is_full(&self, class: QosClass) -> bool {
        self.queues[class as usize].is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}
