//! In-memory radio medium for multi-node simulation
//!
//! Radios attached to a [`SimMedium`] implement the `radio` traits.
//! Transmissions are delivered immediately to every connected radio tuned
//! to the same channel and currently receiving.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;

use crate::codec::phy::FCS_LEN;

/// Noise floor reported when the channel is clear
pub const NOISE_FLOOR: i16 = -110;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimState {
    Idle,
    Receive,
    Transmit,
    Sleep,
}

impl radio::RadioState for SimState {
    fn idle() -> Self {
        SimState::Idle
    }

    fn sleep() -> Self {
        SimState::Sleep
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// Operation not possible while asleep
    Sleeping,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimInfo {
    pub rssi: i16,
}

impl radio::ReceiveInfo for SimInfo {
    fn rssi(&self) -> i16 {
        self.rssi
    }
}

#[derive(Debug)]
struct Port {
    channel: u16,
    state: SimState,
    noise: i16,
    corrupt_next: bool,
    inbox: VecDeque<(Vec<u8>, i16)>,
}

#[derive(Debug, Default)]
struct Medium {
    ports: Vec<Port>,
    /// Link RSSI per connected (a, b) pair with a < b
    links: BTreeMap<(usize, usize), i16>,
    frames: u64,
}

/// Shared simulated medium, clones refer to the same medium
#[derive(Debug, Clone, Default)]
pub struct SimMedium {
    inner: Arc<Mutex<Medium>>,
}

fn key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

impl SimMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<Medium> {
        match self.inner.lock() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        }
    }

    /// Attach a new radio to the medium
    pub fn radio(&self) -> SimRadio {
        let mut m = self.lock();
        m.ports.push(Port {
            channel: 0,
            state: SimState::Idle,
            noise: NOISE_FLOOR,
            corrupt_next: false,
            inbox: VecDeque::new(),
        });

        SimRadio{ id: m.ports.len() - 1, medium: self.clone() }
    }

    /// Connect two radios with a symmetric link at the provided RSSI
    pub fn connect(&self, a: &SimRadio, b: &SimRadio, rssi: i16) {
        self.lock().links.insert(key(a.id, b.id), rssi);
    }

    pub fn disconnect(&self, a: &SimRadio, b: &SimRadio) {
        self.lock().links.remove(&key(a.id, b.id));
    }

    /// Corrupt one payload byte of the next frame sent by `r`
    pub fn corrupt_next(&self, r: &SimRadio) {
        if let Some(p) = self.lock().ports.get_mut(r.id) {
            p.corrupt_next = true;
        }
    }

    /// Set the channel energy sensed by `r`
    pub fn set_noise(&self, r: &SimRadio, rssi: i16) {
        if let Some(p) = self.lock().ports.get_mut(r.id) {
            p.noise = rssi;
        }
    }

    /// Total frames transmitted on the medium
    pub fn frames(&self) -> u64 {
        self.lock().frames
    }
}

/// Radio attached to a [`SimMedium`]
#[derive(Debug, Clone)]
pub struct SimRadio {
    id: usize,
    medium: SimMedium,
}

impl SimRadio {
    pub fn id(&self) -> usize {
        self.id
    }

    fn with_port<R>(&self, f: impl FnOnce(&mut Port) -> R) -> R {
        let mut m = self.medium.lock();
        f(&mut m.ports[self.id])
    }
}

impl radio::State for SimRadio {
    type State = SimState;
    type Error = SimError;

    fn set_state(&mut self, state: Self::State) -> Result<(), Self::Error> {
        self.with_port(|p| p.state = state);
        Ok(())
    }

    fn get_state(&mut self) -> Result<Self::State, Self::Error> {
        Ok(self.with_port(|p| p.state))
    }
}

impl radio::Channel for SimRadio {
    type Channel = u16;
    type Error = SimError;

    fn set_channel(&mut self, channel: &Self::Channel) -> Result<(), Self::Error> {
        self.with_port(|p| {
            p.channel = *channel;
            p.state = SimState::Idle;
            p.inbox.clear();
        });
        Ok(())
    }
}

impl radio::Transmit for SimRadio {
    type Error = SimError;

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let mut m = self.medium.lock();
        let id = self.id;

        let (channel, corrupt) = {
            let p = &mut m.ports[id];
            if p.state == SimState::Sleep {
                return Err(SimError::Sleeping);
            }
            p.state = SimState::Transmit;
            (p.channel, core::mem::replace(&mut p.corrupt_next, false))
        };

        let mut frame = data.to_vec();
        if corrupt && frame.len() > FCS_LEN {
            let i = frame.len() - FCS_LEN - 1;
            frame[i] ^= 0xFF;
        }

        m.frames += 1;

        let receivers: Vec<_> = m.links.iter()
            .filter_map(|((a, b), rssi)| match (*a == id, *b == id) {
                (true, _) => Some((*b, *rssi)),
                (_, true) => Some((*a, *rssi)),
                _ => None,
            })
            .collect();

        for (r, rssi) in receivers {
            let p = &mut m.ports[r];
            if p.channel == channel && p.state == SimState::Receive {
                trace!("Sim deliver {} bytes {} -> {}", frame.len(), id, r);
                p.inbox.push_back((frame.clone(), rssi));
            }
        }

        Ok(())
    }

    fn check_transmit(&mut self) -> Result<bool, Self::Error> {
        self.with_port(|p| {
            if p.state == SimState::Transmit {
                p.state = SimState::Idle;
            }
        });
        Ok(true)
    }
}

impl radio::Receive for SimRadio {
    type Info = SimInfo;
    type Error = SimError;

    fn start_receive(&mut self) -> Result<(), Self::Error> {
        self.with_port(|p| match p.state {
            SimState::Sleep => Err(SimError::Sleeping),
            _ => {
                p.state = SimState::Receive;
                Ok(())
            }
        })
    }

    fn check_receive(&mut self, _restart: bool) -> Result<bool, Self::Error> {
        Ok(self.with_port(|p| !p.inbox.is_empty()))
    }

    fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, Self::Info), Self::Error> {
        let rx = self.with_port(|p| p.inbox.pop_front());

        match rx {
            Some((data, rssi)) => {
                let n = data.len().min(buff.len());
                buff[..n].copy_from_slice(&data[..n]);
                Ok((n, SimInfo{ rssi }))
            },
            None => Ok((0, SimInfo::default())),
        }
    }
}

impl radio::Rssi for SimRadio {
    type Error = SimError;

    fn poll_rssi(&mut self) -> Result<i16, Self::Error> {
        Ok(self.with_port(|p| p.noise))
    }
}

#[cfg(test)]
mod test {
    use radio::{Channel, Receive, Transmit, Rssi};

    use super::*;

    #[test]
    fn delivery_by_link_and_channel() {
        let medium = SimMedium::new();
        let mut a = medium.radio();
        let mut b = medium.radio();
        let mut c = medium.radio();

        medium.connect(&a, &b, -60);

        for r in [&mut a, &mut b, &mut c] {
            r.set_channel(&6).unwrap();
            r.start_receive().unwrap();
        }

        a.start_transmit(&[1, 2, 3]).unwrap();
        assert!(a.check_transmit().unwrap());

        assert!(b.check_receive(true).unwrap());
        assert!(!c.check_receive(true).unwrap());

        let mut buff = [0u8; 8];
        let (n, info) = b.get_received(&mut buff).unwrap();
        assert_eq!(&buff[..n], &[1, 2, 3]);
        assert_eq!(info.rssi, -60);

        // Different channel
        b.set_channel(&11).unwrap();
        b.start_receive().unwrap();
        a.start_transmit(&[4]).unwrap();
        assert!(!b.check_receive(true).unwrap());

        assert_eq!(b.poll_rssi().unwrap(), NOISE_FLOOR);
        assert_eq!(medium.frames(), 2);
    }

    #[test]
    fn corruption() {
        let medium = SimMedium::new();
        let mut a = medium.radio();
        let mut b = medium.radio();
        medium.connect(&a, &b, -60);
        b.start_receive().unwrap();

        medium.corrupt_next(&a);
        a.start_transmit(&[0, 0, 0, 0, 0, 0]).unwrap();
        a.start_transmit(&[0, 0, 0, 0, 0, 0]).unwrap();

        let mut buff = [0u8; 8];
        let (n, _) = b.get_received(&mut buff).unwrap();
        assert_eq!(&buff[..n], &[0, 0xFF, 0, 0, 0, 0]);
        let (n, _) = b.get_received(&mut buff).unwrap();
        assert_eq!(&buff[..n], &[0; 6]);
    }
}
