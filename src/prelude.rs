//! Mesh engine prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::{Radio, RawPacket, Ts};

pub use crate::mac::{Mac, MacEvent, MacState, RxInfo, SyncRole, Tdma};

pub use crate::engine::{Engine, Health};

pub use crate::error::{CoreError, ConfigError, ErrorCode};
pub use crate::timer::{Timer as MacTimer, SystemTimer};

pub use crate::base::{Base as MacBase, BaseState as MacBaseState};

pub use crate::config::Config;
pub use crate::node::{Address, Callsign};
pub use crate::qos::{QosClass, ServiceType};
pub use crate::amc::{Mcs, QualityReport};
