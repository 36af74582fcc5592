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

//! The link every scenario runs on: a four lane root port and endpoint
//! with shortened training so runs stay small.

use pcie::{
    ChannelProperties, DataLinkConfiguration, FailureProperties, LinkConfiguration,
    LinkSimulation, LtssmConfiguration, PcieModel, RegionDescriptor,
};

pub const MEMORY_SIZE: u64 = 0x4000;

pub fn port_configuration(requester_id: u16) -> LinkConfiguration {
    LinkConfiguration {
        lanes: 4,
        requester_id,
        ltssm: LtssmConfiguration {
            detect_quiet_cycles: 4,
            ts_exit_count: 4,
            ts_sent_after_match: 4,
            recovery_timeout: 400,
            recovery_retry_limit: 1,
            ..Default::default()
        },
        data_link: DataLinkConfiguration {
            replay_timeout: 300,
            ack_coalesce: 2,
            completion_timeout: 20_000,
            ..Default::default()
        },
        regions: vec![RegionDescriptor::new(0, MEMORY_SIZE, 1)],
        ..Default::default()
    }
}

pub fn build_link(
    upstream: LinkConfiguration,
    downstream: LinkConfiguration,
    failures: FailureProperties,
) -> anyhow::Result<LinkSimulation> {
    let link = LinkSimulation::new(
        PcieModel::new("root_port", upstream)?,
        PcieModel::new("endpoint", downstream)?,
        ChannelProperties {
            latency: 2,
            lane_reversal: false,
        },
        failures,
    )?;
    Ok(link)
}

/// Step until both ends reach L0.
pub fn bring_up(link: &mut LinkSimulation, limit: usize) -> anyhow::Result<()> {
    if !link.run_until(limit, |l| l.is_link_up())? {
        anyhow::bail!(
            "link did not train within {} cycles: {} / {}",
            limit,
            link.upstream().snapshot(),
            link.downstream().snapshot()
        );
    }
    Ok(())
}
