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

//! Test that random bit errors on the lanes never reach the completer's
//! memory: the LCRC rejects damaged packets and the data link layer
//! replays them.

use crate::link::{bring_up, build_link, port_configuration};
use pcie::{CompletionStatus, FailureProperties, RequestResult, Side};

const BATCHES: u64 = 4;
const BATCH: u64 = 16;
const PAYLOAD: usize = 64;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Counter {
    pub completed: usize,
    pub timed_out: usize,
    /// completed writes whose bytes did not land intact
    pub mismatched: usize,
    pub corrupted_symbols: usize,
    pub lcrc_failures: usize,
    pub recoveries: usize,
}

fn pattern(address: u64) -> Vec<u8> {
    (0..PAYLOAD).map(|i| (address as usize / 8 + i) as u8).collect()
}

// Writes BATCHES * BATCH payloads across the link and checks each one the
// endpoint acknowledged.
pub fn simulate_symbol_corruption(corruption_rate: f64, seed: u64) -> anyhow::Result<Counter> {
    let failures = FailureProperties {
        symbol_corruption_rate: corruption_rate,
        ..FailureProperties::seeded(seed)
    };
    let mut link = build_link(port_configuration(0x0000), port_configuration(0x0100), failures)?;
    bring_up(&mut link, 20_000)?;

    let mut counter = Counter::default();
    for batch in 0..BATCHES {
        for i in 0..BATCH {
            let address = (batch * BATCH + i) * 128;
            link.port_mut(Side::Upstream)
                .submit_write(address, pattern(address))?;
        }
        link.run_until(100_000, |l| l.upstream().outstanding_requests() == 0)?;
        for outcome in link.port_mut(Side::Upstream).take_outcomes() {
            match outcome.result {
                RequestResult::Completed {
                    status: CompletionStatus::Successful,
                    ..
                } => {
                    counter.completed += 1;
                    let (data, _) = link
                        .downstream()
                        .memory()
                        .read(outcome.address, PAYLOAD as u64);
                    if data != pattern(outcome.address) {
                        log::info!("Write @{:#x} corrupt", outcome.address);
                        counter.mismatched += 1;
                    }
                }
                RequestResult::Completed { status, .. } => {
                    log::warn!("Write @{:#x} failed: {}", outcome.address, status);
                }
                RequestResult::TimedOut => counter.timed_out += 1,
            }
        }
    }

    counter.corrupted_symbols = link.channel_statistics(Side::Upstream).corrupted
        + link.channel_statistics(Side::Downstream).corrupted;
    counter.lcrc_failures = link.downstream().statistics().data_link.lcrc_failures
        + link.upstream().statistics().data_link.lcrc_failures;
    counter.recoveries = link.upstream().statistics().ltssm.recoveries;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use crate::symbol_corruption::{simulate_symbol_corruption, Counter};

    #[test]
    fn test_symbol_corruption() {
        let _ = env_logger::try_init();

        // Sanity check, without corruption every write completes on the
        // first attempt.
        let counter = simulate_symbol_corruption(0.0, 1).unwrap();
        log::info!("No corruption: {:?}", counter);
        assert_eq!(
            counter,
            Counter {
                completed: 64,
                ..Default::default()
            }
        );

        // With some corruption the link retrains and replays, but nothing
        // the endpoint acknowledged is damaged.
        let counter = simulate_symbol_corruption(1e-4, 1).unwrap();
        log::info!("Some corruption: {:?}", counter);
        assert!(counter.corrupted_symbols > 0);
        assert_eq!(counter.mismatched, 0);
        assert_eq!(counter.completed + counter.timed_out, 64);
    }

    #[test]
    fn test_same_seed_same_run() {
        let _ = env_logger::try_init();
        assert_eq!(
            simulate_symbol_corruption(5e-4, 99).unwrap(),
            simulate_symbol_corruption(5e-4, 99).unwrap()
        );
    }
}
