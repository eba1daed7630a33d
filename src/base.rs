//! Radio wrapper tracking transmit / receive state
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::{fmt::Debug, marker::PhantomData};

use log::{trace, debug};

use crate::{Radio, RawPacket, Ts, error::CoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct Base<R, S, I, E> {
    radio: R,
    state: BaseState,
    last_change: Ts,

    _radio_state: PhantomData<S>,
    _radio_info: PhantomData<I>,
    _radio_err: PhantomData<E>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BaseState {
    Idle,
    Listening,
    Transmitting,
    Sleeping,
}

impl <R, S, I, E> Base<R, S, I, E>
where
    R: Radio<S, I, E>,
    S: radio::RadioState,
    I: radio::ReceiveInfo + Default + Debug,
    E: Debug,
{
    pub fn new(radio: R) -> Result<Self, CoreError<E>> {
        Ok(Self {
            radio,
            state: BaseState::Idle,
            last_change: 0,
            _radio_state: PhantomData,
            _radio_info: PhantomData,
            _radio_err: PhantomData,
        })
    }

    pub fn state(&self) -> BaseState {
        self.state.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state == BaseState::Transmitting
    }

    /// Time of the last state change
    pub fn last_change(&self) -> Ts {
        self.last_change
    }

    /// Enter receive mode
    pub fn receive(&mut self, now: Ts) -> Result<(), CoreError<E>> {
        trace!("Start receive at {} us", now);

        self.radio.start_receive().map_err(CoreError::Radio)?;

        self.state = BaseState::Listening;
        self.last_change = now;

        Ok(())
    }

    /// Start a transmission, failing if one is already in progress
    pub fn transmit(&mut self, now: Ts, data: &[u8]) -> Result<(), CoreError<E>> {
        if self.is_busy() {
            return Err(CoreError::Busy);
        }

        debug!("Transmit {} bytes at {} us", data.len(), now);

        self.radio.start_transmit(data).map_err(CoreError::Radio)?;

        self.state = BaseState::Transmitting;
        self.last_change = now;

        Ok(())
    }

    /// Poll the radio, returning to receive mode after transmissions
    /// and returning any received packet
    pub fn tick(&mut self, now: Ts) -> Result<Option<RawPacket>, CoreError<E>> {
        match self.state {
            BaseState::Transmitting => {
                if self.radio.check_transmit().map_err(CoreError::Radio)? {
                    trace!("Transmit complete after {} us", now.saturating_sub(self.last_change));
                    self.receive(now)?;
                }
                Ok(None)
            },
            BaseState::Listening => {
                if !self.radio.check_receive(true).map_err(CoreError::Radio)? {
                    return Ok(None);
                }

                let mut rx = RawPacket::default();
                let (n, info) = self.radio.get_received(&mut rx.data).map_err(CoreError::Radio)?;
                rx.len = n;
                rx.rssi = info.rssi();

                trace!("Received {} bytes at {} us (rssi: {})", n, now, rx.rssi);

                self.receive(now)?;

                Ok(Some(rx))
            },
            BaseState::Idle | BaseState::Sleeping => Ok(None),
        }
    }

    /// Sample channel energy
    pub fn rssi(&mut self) -> Result<i16, CoreError<E>> {
        self.radio.poll_rssi().map_err(CoreError::Radio)
    }

    pub fn sleep(&mut self) -> Result<(), CoreError<E>> {
        self.radio.set_state(S::sleep()).map_err(CoreError::Radio)?;
        self.state = BaseState::Sleeping;
        Ok(())
    }
}

impl <R, S, I, E> Base<R, S, I, E>
where
    R: Radio<S, I, E> + radio::Channel<Error=E>,
    S: radio::RadioState,
    I: radio::ReceiveInfo + Default + Debug,
    E: Debug,
{
    /// Retune, leaving the radio idle
    pub fn set_channel(&mut self, channel: &<R as radio::Channel>::Channel) -> Result<(), CoreError<E>> {
        self.radio.set_channel(channel).map_err(CoreError::Radio)?;
        self.state = BaseState::Idle;
        Ok(())
    }
}
