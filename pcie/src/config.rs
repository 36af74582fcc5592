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

use crate::crc::CrcParameters;
use crate::error::Error;
use crate::memory::{MemoryModel, RegionDescriptor};
use crate::symbol::{LinkSpeed, SHORT_SET_LEN, TRAINING_SET_LEN};
use crate::Cycle;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Most lanes a port may be configured with.
pub const MAX_LANES: u8 = 32;

/// Largest retry buffer that keeps sequence comparisons unambiguous.
pub const MAX_RETRY_BUFFER: usize = 2047;

/// Cycle budgets and handshake counts of the training state machine.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LtssmConfiguration {
    /// cycles of electrical idle at the start of Detect
    pub detect_quiet_cycles: Cycle,
    pub polling_timeout: Cycle,
    pub configuration_timeout: Cycle,
    /// budget for each attempt at a Recovery handshake
    pub recovery_timeout: Cycle,
    pub recovery_retry_limit: u32,
    /// consecutive matching training sets that end a handshake phase
    pub ts_exit_count: usize,
    /// training sets still sent after the first matching one was received
    pub ts_sent_after_match: usize,
    /// logical idle symbols received before entering L0
    pub idle_exit_count: usize,
    /// training sets announcing Disabled before going electrically idle
    pub announce_count: usize,
    pub n_fts: u8,
}

impl LtssmConfiguration {
    /// The fewest cycles a TS1/TS2 handshake phase can take.
    pub fn minimum_handshake_cycles(&self) -> Cycle {
        (self.ts_exit_count + self.ts_sent_after_match + 1) * TRAINING_SET_LEN
    }
}

impl Default for LtssmConfiguration {
    fn default() -> Self {
        Self {
            detect_quiet_cycles: 16,
            polling_timeout: 4096,
            configuration_timeout: 4096,
            recovery_timeout: 2048,
            recovery_retry_limit: 3,
            ts_exit_count: 8,
            ts_sent_after_match: 8,
            idle_exit_count: 8,
            announce_count: 4,
            n_fts: 32,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CodecConfiguration {
    /// cycles between SKP ordered sets; 0 disables them
    pub skip_interval: Cycle,
}

impl Default for CodecConfiguration {
    fn default() -> Self {
        Self {
            skip_interval: 1180,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DataLinkConfiguration {
    /// replays without forward progress before retraining the link
    pub replay_limit: u32,
    /// cycles without forward progress before replaying
    pub replay_timeout: Cycle,
    /// received transaction frames acknowledged by one Ack
    pub ack_coalesce: usize,
    pub retry_buffer_capacity: usize,
    /// cycles a request waits for its completion
    pub completion_timeout: Cycle,
}

impl Default for DataLinkConfiguration {
    fn default() -> Self {
        Self {
            replay_limit: 3,
            replay_timeout: 1024,
            ack_coalesce: 4,
            retry_buffer_capacity: 256,
            completion_timeout: 50_000,
        }
    }
}

/// Everything needed to build one port of a link.
///
/// Constructed programmatically or read from a YAML file; missing fields
/// take their default values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LinkConfiguration {
    /// physical lanes, and the width this port proposes
    pub lanes: u8,
    pub max_speed: LinkSpeed,
    /// identifier stamped on requests and completions from this port
    pub requester_id: u16,
    pub ltssm: LtssmConfiguration,
    pub codec: CodecConfiguration,
    pub data_link: DataLinkConfiguration,
    pub lcrc: CrcParameters,
    pub regions: Vec<RegionDescriptor>,
}

impl Default for LinkConfiguration {
    fn default() -> Self {
        Self {
            lanes: 4,
            max_speed: LinkSpeed::Gen3,
            requester_id: 0x0100,
            ltssm: LtssmConfiguration::default(),
            codec: CodecConfiguration::default(),
            data_link: DataLinkConfiguration::default(),
            lcrc: CrcParameters::LCRC,
            regions: vec![RegionDescriptor::new(0, 0x1_0000, 1)],
        }
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidConfiguration(reason)
}

impl LinkConfiguration {
    pub fn from_file(file_name: &str) -> anyhow::Result<Self> {
        let file = File::open(Path::new(file_name))
            .with_context(|| format!("cannot open link configuration {}", file_name))?;
        let config: LinkConfiguration = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("cannot parse link configuration {}", file_name))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(config: &str) -> anyhow::Result<Self> {
        let config: LinkConfiguration =
            serde_yaml::from_str(config).context("cannot parse link configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values no link can train or run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.lanes == 0 || self.lanes > MAX_LANES {
            return Err(invalid(format!(
                "{} lanes, expected 1..={}",
                self.lanes, MAX_LANES
            )));
        }

        let ltssm = &self.ltssm;
        if ltssm.ts_exit_count == 0 || ltssm.idle_exit_count == 0 {
            return Err(invalid("handshake counts must be positive".to_string()));
        }
        let minimum = ltssm.minimum_handshake_cycles();
        for (name, timeout) in [
            ("polling_timeout", ltssm.polling_timeout),
            ("configuration_timeout", ltssm.configuration_timeout),
            ("recovery_timeout", ltssm.recovery_timeout),
        ] {
            if timeout < minimum {
                return Err(invalid(format!(
                    "{} of {} cycles is shorter than a handshake ({} cycles)",
                    name, timeout, minimum
                )));
            }
        }

        // zero turns clock compensation off; anything else must leave room
        // between SKP ordered sets
        let skip_interval = self.codec.skip_interval;
        if skip_interval != 0 && skip_interval <= SHORT_SET_LEN {
            return Err(invalid(format!(
                "skip_interval of {} cycles leaves no room for traffic, expected 0 or more than {}",
                skip_interval, SHORT_SET_LEN
            )));
        }

        let data_link = &self.data_link;
        if data_link.retry_buffer_capacity == 0 || data_link.retry_buffer_capacity > MAX_RETRY_BUFFER
        {
            return Err(invalid(format!(
                "retry buffer of {} frames, expected 1..={}",
                data_link.retry_buffer_capacity, MAX_RETRY_BUFFER
            )));
        }
        if data_link.replay_timeout == 0
            || data_link.ack_coalesce == 0
            || data_link.completion_timeout == 0
        {
            return Err(invalid(
                "data-link timers and ack coalescing must be positive".to_string(),
            ));
        }

        self.lcrc.validate()?;
        MemoryModel::new(&self.regions)?;
        Ok(())
    }
}
