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

//! Test that losing lane 0 drops the link to Detect once Recovery gives
//! up, and that it trains again when the lane comes back.

use crate::link::{bring_up, build_link, port_configuration};
use pcie::{
    CompletionStatus, Cycle, FailureProperties, LaneOutage, RequestResult, Side, StateKind,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outage {
    pub link_ups: usize,
    pub recoveries: usize,
    pub timeouts: usize,
    /// cycles from the start of the outage until L0 again
    pub restored_after: Cycle,
    /// a read after the outage returned what was written before it
    pub memory_intact: bool,
}

pub fn simulate_lane_outage(lane: usize, duration: Cycle) -> anyhow::Result<Outage> {
    let mut link = build_link(
        port_configuration(0x0000),
        port_configuration(0x0100),
        FailureProperties::default(),
    )?;
    bring_up(&mut link, 5_000)?;
    let data = (0..32u8).collect::<Vec<_>>();
    link.port_mut(Side::Upstream).submit_write(0x300, data.clone())?;
    link.run_until(5_000, |l| l.upstream().outstanding_requests() == 0)?;

    let from = link.cycle();
    link.failures_mut().lane_outages.push(LaneOutage {
        lane,
        from,
        until: from + duration,
    });
    link.run(duration)?;
    if link.upstream().state().kind() != StateKind::Detect {
        log::warn!("root port still in {} after outage", link.upstream().state());
    }
    bring_up(&mut link, 20_000)?;
    let restored_after = link.cycle() - from;

    link.port_mut(Side::Upstream).take_outcomes();
    link.port_mut(Side::Upstream).submit_read(0x300, 32)?;
    link.run_until(5_000, |l| l.upstream().outstanding_requests() == 0)?;
    let memory_intact = link
        .port_mut(Side::Upstream)
        .take_outcomes()
        .iter()
        .any(|outcome| {
            outcome.result
                == RequestResult::Completed {
                    status: CompletionStatus::Successful,
                    data: data.clone(),
                }
        });

    let stats = link.upstream().statistics();
    Ok(Outage {
        link_ups: stats.ltssm.link_ups,
        recoveries: stats.ltssm.recoveries,
        timeouts: stats.ltssm.timeouts,
        restored_after,
        memory_intact,
    })
}

#[cfg(test)]
mod tests {
    use crate::lane_outage::simulate_lane_outage;

    #[test]
    fn test_lane_zero_outage() {
        let _ = env_logger::try_init();
        let outage = simulate_lane_outage(0, 3000).unwrap();
        log::info!("{:?}", outage);
        // L0 -> Recovery -> (retry) -> Detect -> ... -> L0
        assert_eq!(outage.link_ups, 2);
        assert_eq!(outage.recoveries, 1);
        assert_eq!(outage.timeouts, 1);
        assert!(outage.restored_after > 3000);
        assert!(outage.memory_intact);
    }
}
