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

//! Test that a transaction packet the peer keeps rejecting makes the
//! sender retrain the link exactly once, after which the replay gets
//! through.

use crate::link::{bring_up, build_link, port_configuration};
use pcie::{DataCorruption, FailureProperties, RequestResult, Side, StateKind};

const ADDRESS: u64 = 0x80;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Exhaustion {
    pub naks_received: usize,
    pub replays: usize,
    pub retrain_requests: usize,
    pub recoveries: usize,
    pub result: Option<RequestResult>,
    /// the payload reached the endpoint's memory
    pub delivered: bool,
}

pub fn simulate_retry_exhaustion(replay_limit: u32) -> anyhow::Result<Exhaustion> {
    let mut upstream = port_configuration(0x0000);
    upstream.data_link.replay_limit = replay_limit;
    let mut link = build_link(upstream, port_configuration(0x0100), FailureProperties::default())?;
    bring_up(&mut link, 5_000)?;

    // damage every data byte the root port sends until it gives up
    let from = link.cycle();
    link.failures_mut().data_corruptions.push(DataCorruption {
        side: Side::Upstream,
        from,
        until: usize::MAX,
    });
    let data = vec![0xa5; 64];
    link.port_mut(Side::Upstream)
        .submit_write(ADDRESS, data.clone())?;
    let retrained = link.run_until(20_000, |l| {
        l.upstream().state().kind() == StateKind::Recovery
    })?;
    if !retrained {
        anyhow::bail!("root port never left L0: {}", link.upstream().snapshot());
    }
    log::info!("Retraining after {} cycles", link.cycle() - from);
    link.failures_mut().data_corruptions.clear();

    link.run_until(50_000, |l| l.upstream().outstanding_requests() == 0)?;
    let result = link
        .port_mut(Side::Upstream)
        .take_outcomes()
        .pop()
        .map(|outcome| outcome.result);
    let stats = link.upstream().statistics();
    Ok(Exhaustion {
        naks_received: stats.data_link.naks_received,
        replays: stats.data_link.replays,
        retrain_requests: stats.data_link.retrain_requests,
        recoveries: stats.ltssm.recoveries,
        result,
        delivered: link.downstream().memory().read(ADDRESS, 64).0 == data,
    })
}

#[cfg(test)]
mod tests {
    use crate::retry_exhaustion::simulate_retry_exhaustion;
    use pcie::{CompletionStatus, RequestResult};

    #[test]
    fn test_retry_exhaustion() {
        let _ = env_logger::try_init();
        for replay_limit in [1, 3] {
            let exhaustion = simulate_retry_exhaustion(replay_limit).unwrap();
            log::info!("Replay limit {}: {:?}", replay_limit, exhaustion);
            assert!(exhaustion.naks_received >= 1);
            assert!(exhaustion.replays > replay_limit as usize);
            assert_eq!(exhaustion.retrain_requests, 1);
            assert_eq!(exhaustion.recoveries, 1);
            assert_eq!(
                exhaustion.result,
                Some(RequestResult::Completed {
                    status: CompletionStatus::Successful,
                    data: vec![]
                })
            );
            assert!(exhaustion.delivered);
        }
    }
}
