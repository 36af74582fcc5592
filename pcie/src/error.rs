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

use std::fmt;

use crate::Cycle;

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Error {
    /// Two configured memory regions share at least one address.
    OverlappingRegions { first: u64, second: u64 },
    /// A region descriptor is empty, wraps the address space, or has an
    /// unusable access granularity.
    InvalidRegion(u64),
    /// The CRC generator parameters cannot describe a usable code.
    InvalidPolynomial { width: u8, polynomial: u32 },
    InvalidConfiguration(String),
    /// A request cannot be expressed as a transaction packet.
    InvalidRequest(String),
    /// All request tags are waiting for completions.
    TagsExhausted,
    /// The port was stepped after `shutdown`.
    PortShutdown(Cycle),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OverlappingRegions { first, second } => write!(
                f,
                "ERROR: memory regions at {:#x} and {:#x} overlap",
                first, second
            ),
            Self::InvalidRegion(base) => {
                write!(f, "ERROR: invalid memory region at {:#x}", base)
            }
            Self::InvalidPolynomial { width, polynomial } => write!(
                f,
                "ERROR: invalid {}-bit generator polynomial {:#x}",
                width, polynomial
            ),
            Self::InvalidConfiguration(reason) => {
                write!(f, "ERROR: invalid link configuration: {}", reason)
            }
            Self::InvalidRequest(reason) => write!(f, "ERROR: invalid request: {}", reason),
            Self::TagsExhausted => write!(f, "ERROR: no free request tags"),
            Self::PortShutdown(cycle) => {
                write!(f, "ERROR: port stepped after shutdown @cycle {}", cycle)
            }
        }
    }
}

// this is needed to allow `anyhow::Result` to accept our definition of
// errors when loading configurations.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
