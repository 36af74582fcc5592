// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cycle-accurate model of a PCIe-class link port: lane symbols in, lane
//! symbols out, with link training, framing, the data link layer's
//! acknowledge and replay protocol, and a memory completer behind it.

// protocol layers, bottom up
pub mod line;
pub mod symbol;
pub mod codec;
pub mod crc;
pub mod ltssm;
pub mod dll;
pub mod transaction;

mod config;
mod error;
mod memory;
mod model;
mod sim;
mod vcd;

// type to use for cycles
pub type Cycle = usize;

pub use crate::config::{
    CodecConfiguration, DataLinkConfiguration, LinkConfiguration, LtssmConfiguration,
};
pub use crate::crc::{Crc, CrcParameters};
pub use crate::error::Error;
pub use crate::ltssm::{LinkCommand, LinkParameters, LtssmState, StateKind};
pub use crate::memory::{MemoryModel, MemoryStatus, RegionDescriptor};
pub use crate::model::{CosimPort, LinkSnapshot, LinkStatistics, PcieModel};
pub use crate::sim::{
    ChannelProperties, ChannelStatistics, DataCorruption, FailureProperties, LaneOutage,
    LinkSimulation, Side,
};
pub use crate::symbol::{LinkSpeed, Symbol};
pub use crate::transaction::{CompletionStatus, RequestKind, RequestOutcome, RequestResult};
pub use crate::vcd::{VcdComponent, VcdWriter};
