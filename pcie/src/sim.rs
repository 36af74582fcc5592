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

//! Two ports connected back to back through simulated lanes.
//!
//! Every lane symbol crosses the channel as an 8b/10b code group, so
//! injected bit errors surface the way a receiver would see them: as a
//! different symbol, a disparity error or an invalid code group.

use crate::error::Error;
use crate::line::{LineDecoder, LineEncoder, LineError, TenBitCode};
use crate::model::{CosimPort, PcieModel};
use crate::symbol::{ControlCode, Symbol};
use crate::vcd::{VcdComponent, VcdWriter};
use crate::Cycle;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Side {
    Upstream,
    Downstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Upstream => f.write_str("upstream"),
            Side::Downstream => f.write_str("downstream"),
        }
    }
}

/// A lane that carries no signal, in both directions, for cycles
/// `from..until`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaneOutage {
    pub lane: usize,
    pub from: Cycle,
    pub until: Cycle,
}

/// Every data symbol sent by `side` during `from..until` arrives with its
/// lowest bit inverted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataCorruption {
    pub side: Side,
    pub from: Cycle,
    pub until: Cycle,
}

/// Characteristics of the failures we inject into the simulation.
pub struct FailureProperties {
    /// Probability a code group has one bit flipped in transit.
    pub symbol_corruption_rate: f64,

    /// Random number generator used to calculate probabilities.
    /// Note: the RNG provided by the Default implementation is deterministic.
    pub rng: Box<dyn RngCore>,

    pub lane_outages: Vec<LaneOutage>,

    pub data_corruptions: Vec<DataCorruption>,
}

impl FailureProperties {
    /// No failures, with the RNG seeded from `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Box::new(Xoshiro256StarStar::seed_from_u64(seed)),
            ..Default::default()
        }
    }

    fn lane_dead(&self, lane: usize, cycle: Cycle) -> bool {
        self.lane_outages
            .iter()
            .any(|o| o.lane == lane && (o.from..o.until).contains(&cycle))
    }

    fn corrupts_data(&self, side: Side, cycle: Cycle) -> bool {
        self.data_corruptions
            .iter()
            .any(|c| c.side == side && (c.from..c.until).contains(&cycle))
    }
}

impl Default for FailureProperties {
    /// Default values, assuming no failures.
    /// Note the RNG provided by the Default implementation is deterministic.
    fn default() -> Self {
        Self {
            symbol_corruption_rate: 0.0,
            rng: Box::new(Xoshiro256StarStar::seed_from_u64(0x87654321FEDCBA09u64)),
            lane_outages: vec![],
            data_corruptions: vec![],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChannelProperties {
    /// cycles a symbol spends on the wire
    pub latency: Cycle,
    /// lane `i` of one port is wired to lane `n - 1 - i` of the other
    pub lane_reversal: bool,
}

type CodeGroups = Vec<Option<TenBitCode>>;

struct LinkBuffer {
    /// Circular buffer holding the code groups in flight, one entry per cycle.
    buffer: Vec<CodeGroups>,

    /// The write pointer into the circular buffer.
    write_idx: usize,

    /// The read pointer into the circular buffer.
    read_idx: usize,

    /// The number of cycles in the buffer.
    occupancy: usize,
}

impl LinkBuffer {
    fn new(lanes: usize, latency: Cycle) -> Self {
        Self {
            buffer: vec![vec![None; lanes]; latency + 1],
            write_idx: latency,
            read_idx: 0,
            occupancy: latency,
        }
    }

    /// Fill the link with one cycle of code groups.
    fn write_cycle(&mut self, codes: CodeGroups) {
        debug_assert!(self.occupancy < self.buffer.len());
        self.buffer[self.write_idx] = codes;
        self.write_idx = (self.write_idx + 1) % self.buffer.len();
        self.occupancy += 1;
    }

    /// Drain the oldest cycle from the link.
    fn read_cycle(&mut self) -> CodeGroups {
        debug_assert!(self.occupancy > 0);
        let codes = std::mem::take(&mut self.buffer[self.read_idx]);
        self.read_idx = (self.read_idx + 1) % self.buffer.len();
        self.occupancy -= 1;
        log::trace!(
            "read_cycle read_idx: {}, occupancy: {}",
            self.read_idx,
            self.occupancy
        );
        codes
    }
}

/// One direction of the link.
struct Channel {
    from: Side,
    encoders: Vec<LineEncoder>,
    decoders: Vec<LineDecoder>,
    buffer: LinkBuffer,
    corrupted: usize,
    code_errors: usize,
}

impl Channel {
    fn new(from: Side, lanes: usize, latency: Cycle) -> Self {
        Self {
            from,
            encoders: vec![LineEncoder::new(); lanes],
            decoders: (0..lanes).map(|_| LineDecoder::new()).collect(),
            buffer: LinkBuffer::new(lanes, latency),
            corrupted: 0,
            code_errors: 0,
        }
    }

    fn carry(
        &mut self,
        symbols: &[Symbol],
        cycle: Cycle,
        failures: &mut FailureProperties,
        lane_reversal: bool,
    ) -> Vec<Symbol> {
        let corrupt_data = failures.corrupts_data(self.from, cycle);
        let mut codes = self
            .encoders
            .iter_mut()
            .zip(symbols.iter().copied().chain(std::iter::repeat(Symbol::ElectricalIdle)))
            .enumerate()
            .map(|(lane, (encoder, symbol))| {
                let symbol = match symbol {
                    Symbol::Data(byte) if corrupt_data => Symbol::Data(byte ^ 1),
                    _ => symbol,
                };
                if failures.lane_dead(lane, cycle) {
                    encoder.encode(Symbol::ElectricalIdle)
                } else {
                    encoder.encode(symbol)
                }
            })
            .collect::<CodeGroups>();

        // If the simulation specified a random corruption rate, randomly
        // mess with the transmitted bits.
        if failures.symbol_corruption_rate > 0.0 {
            for (lane, code) in codes.iter_mut().enumerate() {
                if let Some(code) = code {
                    if failures.rng.gen_bool(failures.symbol_corruption_rate) {
                        let bit: u16 = failures.rng.gen_range(0..10);
                        log::info!(
                            "Randomly injecting symbol corruption; from {} lane {} bit {} @cycle {}",
                            self.from,
                            lane,
                            bit,
                            cycle
                        );
                        code.0 ^= 1 << bit;
                        self.corrupted += 1;
                    }
                }
            }
        }

        self.buffer.write_cycle(codes);
        let arrived = self.buffer.read_cycle();
        let from = self.from;
        let code_errors = &mut self.code_errors;
        let mut received = self
            .decoders
            .iter_mut()
            .zip(arrived)
            .map(|(decoder, code)| match decoder.decode(code) {
                Ok(symbol) | Err(LineError::Disparity(symbol)) => symbol,
                Err(LineError::InvalidCode(code)) => {
                    log::debug!("invalid code group {} from {}", code, from);
                    *code_errors += 1;
                    Symbol::Control(ControlCode::Edb)
                }
            })
            .collect::<Vec<_>>();
        if lane_reversal {
            received.reverse();
        }
        received
    }
}

/// Counters of what the channels did to the traffic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChannelStatistics {
    /// code groups with an injected bit error
    pub corrupted: usize,
    /// code groups the receiver could not decode
    pub code_errors: usize,
}

/// Two ports stepped once per cycle, each receiving what the other sent.
pub struct LinkSimulation {
    upstream: PcieModel,
    downstream: PcieModel,
    to_upstream: Vec<Symbol>,
    to_downstream: Vec<Symbol>,
    /// upstream to downstream
    down_channel: Channel,
    /// downstream to upstream
    up_channel: Channel,
    properties: ChannelProperties,
    failures: FailureProperties,
    cycle: Cycle,
    vcd: Option<Rc<RefCell<VcdWriter>>>,
}

impl LinkSimulation {
    pub fn new(
        upstream: PcieModel,
        downstream: PcieModel,
        properties: ChannelProperties,
        failures: FailureProperties,
    ) -> Result<Self, Error> {
        let up_lanes = upstream.configuration().lanes as usize;
        let down_lanes = downstream.configuration().lanes as usize;
        if properties.lane_reversal && up_lanes != down_lanes {
            return Err(Error::InvalidConfiguration(format!(
                "lane reversal needs equal lane counts, got {} and {}",
                up_lanes, down_lanes
            )));
        }
        Ok(Self {
            upstream,
            downstream,
            to_upstream: vec![],
            to_downstream: vec![],
            down_channel: Channel::new(Side::Upstream, up_lanes, properties.latency),
            up_channel: Channel::new(Side::Downstream, down_lanes, properties.latency),
            properties,
            failures,
            cycle: 0,
            vcd: None,
        })
    }

    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn port(&self, side: Side) -> &PcieModel {
        match side {
            Side::Upstream => &self.upstream,
            Side::Downstream => &self.downstream,
        }
    }

    pub fn port_mut(&mut self, side: Side) -> &mut PcieModel {
        match side {
            Side::Upstream => &mut self.upstream,
            Side::Downstream => &mut self.downstream,
        }
    }

    pub fn upstream(&self) -> &PcieModel {
        &self.upstream
    }

    pub fn downstream(&self) -> &PcieModel {
        &self.downstream
    }

    pub fn failures_mut(&mut self) -> &mut FailureProperties {
        &mut self.failures
    }

    /// Channel counters for traffic sent by `side`.
    pub fn channel_statistics(&self, side: Side) -> ChannelStatistics {
        let channel = match side {
            Side::Upstream => &self.down_channel,
            Side::Downstream => &self.up_channel,
        };
        ChannelStatistics {
            corrupted: channel.corrupted,
            code_errors: channel.code_errors,
        }
    }

    /// Dump both ports to `writer` from now on.
    pub fn trace(&mut self, writer: Rc<RefCell<VcdWriter>>) {
        VcdWriter::write_header(Rc::clone(&writer), &self.components());
        self.vcd = Some(writer);
    }

    fn components(&self) -> [&dyn VcdComponent; 2] {
        [&self.upstream, &self.downstream]
    }

    pub fn step(&mut self) -> Result<(), Error> {
        let from_upstream = self.upstream.step(&self.to_upstream)?;
        let from_downstream = self.downstream.step(&self.to_downstream)?;
        let reversal = self.properties.lane_reversal;
        self.to_downstream =
            self.down_channel
                .carry(&from_upstream, self.cycle, &mut self.failures, reversal);
        self.to_upstream =
            self.up_channel
                .carry(&from_downstream, self.cycle, &mut self.failures, reversal);
        self.cycle += 1;
        if let Some(writer) = &self.vcd {
            VcdWriter::write_cycle(Rc::clone(writer), self.cycle as u64, &self.components());
        }
        Ok(())
    }

    pub fn run(&mut self, cycles: Cycle) -> Result<(), Error> {
        for _ in 0..cycles {
            self.step()?;
        }
        Ok(())
    }

    /// Step until `done` holds, for at most `limit` cycles. Returns whether
    /// `done` held.
    pub fn run_until<F>(&mut self, limit: Cycle, mut done: F) -> Result<bool, Error>
    where
        F: FnMut(&Self) -> bool,
    {
        for _ in 0..limit {
            if done(self) {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(done(self))
    }

    pub fn is_link_up(&self) -> bool {
        self.upstream.is_link_up() && self.downstream.is_link_up()
    }

    pub fn shutdown(&mut self) {
        self.upstream.shutdown();
        self.downstream.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataLinkConfiguration, LinkConfiguration, LtssmConfiguration};
    use crate::memory::{MemoryStatus, RegionDescriptor};
    use crate::transaction::{CompletionStatus, RequestResult};

    fn config(lanes: u8, requester_id: u16) -> LinkConfiguration {
        LinkConfiguration {
            lanes,
            requester_id,
            ltssm: LtssmConfiguration {
                detect_quiet_cycles: 4,
                ts_exit_count: 4,
                ts_sent_after_match: 4,
                ..Default::default()
            },
            data_link: DataLinkConfiguration {
                ack_coalesce: 2,
                replay_timeout: 300,
                ..Default::default()
            },
            regions: vec![RegionDescriptor::new(0, 0x1000, 1)],
            ..Default::default()
        }
    }

    fn simulation(properties: ChannelProperties, failures: FailureProperties) -> LinkSimulation {
        LinkSimulation::new(
            PcieModel::new("rc", config(4, 0x0000)).unwrap(),
            PcieModel::new("ep", config(4, 0x0100)).unwrap(),
            properties,
            failures,
        )
        .unwrap()
    }

    #[test]
    fn test_link_buffer_latency() {
        let mut buffer = LinkBuffer::new(1, 2);
        let code = |v| vec![Some(TenBitCode(v))];
        buffer.write_cycle(code(1));
        assert_eq!(buffer.read_cycle(), vec![None]);
        buffer.write_cycle(code(2));
        assert_eq!(buffer.read_cycle(), vec![None]);
        buffer.write_cycle(code(3));
        assert_eq!(buffer.read_cycle(), code(1));
        buffer.write_cycle(code(4));
        assert_eq!(buffer.read_cycle(), code(2));
    }

    #[test]
    fn test_channel_is_transparent() {
        let mut failures = FailureProperties::default();
        let mut channel = Channel::new(Side::Upstream, 2, 0);
        let symbols = vec![Symbol::COM, Symbol::Data(0x4a)];
        assert_eq!(channel.carry(&symbols, 0, &mut failures, false), symbols);
        assert_eq!(
            channel.carry(&symbols, 1, &mut failures, true),
            vec![Symbol::Data(0x4a), Symbol::COM]
        );
        assert_eq!(
            channel.carry(&[], 2, &mut failures, false),
            vec![Symbol::ElectricalIdle; 2]
        );
    }

    #[test]
    fn test_outage_and_data_corruption() {
        let mut failures = FailureProperties {
            lane_outages: vec![LaneOutage {
                lane: 1,
                from: 1,
                until: 2,
            }],
            data_corruptions: vec![DataCorruption {
                side: Side::Upstream,
                from: 2,
                until: 3,
            }],
            ..Default::default()
        };
        let mut channel = Channel::new(Side::Upstream, 2, 0);
        let symbols = vec![Symbol::IDLE, Symbol::Data(0x10)];
        let received = (0..4)
            .map(|cycle| channel.carry(&symbols, cycle, &mut failures, false)[1])
            .collect::<Vec<_>>();
        assert_eq!(
            received,
            vec![
                Symbol::Data(0x10),
                Symbol::ElectricalIdle,
                Symbol::Data(0x11),
                Symbol::Data(0x10)
            ]
        );
    }

    #[test]
    fn test_invalid_code_group_arrives_as_edb() {
        let mut failures = FailureProperties::default();
        let mut channel = Channel::new(Side::Downstream, 1, 1);
        // all zeros is not a valid 8b/10b code group
        channel.buffer.buffer[0] = vec![Some(TenBitCode(0))];
        assert_eq!(
            channel.carry(&[Symbol::IDLE], 0, &mut failures, false),
            vec![Symbol::Control(ControlCode::Edb)]
        );
        assert_eq!(channel.code_errors, 1);
        assert_eq!(channel.corrupted, 0);
        assert_eq!(
            channel.carry(&[Symbol::IDLE], 1, &mut failures, false),
            vec![Symbol::IDLE]
        );
        assert_eq!(channel.code_errors, 1);
    }

    #[test]
    fn test_reversed_link_with_latency() {
        let _ = env_logger::try_init();
        let properties = ChannelProperties {
            latency: 3,
            lane_reversal: true,
        };
        let mut sim = simulation(properties, FailureProperties::default());
        assert!(sim.run_until(3_000, |s| s.is_link_up()).unwrap());
        assert!(sim.upstream().snapshot().lane_reversal);
        assert!(sim.downstream().snapshot().lane_reversal);

        let data = (0..100u8).collect::<Vec<_>>();
        sim.port_mut(Side::Upstream)
            .submit_write(0x200, data.clone())
            .unwrap();
        sim.port_mut(Side::Upstream).submit_read(0x200, 100).unwrap();
        let mut outcomes = vec![];
        assert!(sim
            .run_until(3_000, |s| s.upstream().outstanding_requests() == 0)
            .unwrap());
        outcomes.extend(sim.port_mut(Side::Upstream).take_outcomes());
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[1].result,
            RequestResult::Completed {
                status: CompletionStatus::Successful,
                data
            }
        );
    }

    #[test]
    fn test_reversal_needs_equal_lanes() {
        let result = LinkSimulation::new(
            PcieModel::new("rc", config(8, 0)).unwrap(),
            PcieModel::new("ep", config(4, 1)).unwrap(),
            ChannelProperties {
                latency: 0,
                lane_reversal: true,
            },
            FailureProperties::default(),
        );
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_random_corruption_never_corrupts_memory() {
        let _ = env_logger::try_init();
        let failures = FailureProperties {
            symbol_corruption_rate: 1e-4,
            ..FailureProperties::seeded(7)
        };
        let mut sim = simulation(ChannelProperties::default(), failures);
        assert!(sim.run_until(5_000, |s| s.is_link_up()).unwrap());
        for i in 0..16u64 {
            sim.port_mut(Side::Upstream)
                .submit_write(i * 64, vec![i as u8 + 1; 32])
                .unwrap();
        }
        assert!(sim
            .run_until(200_000, |s| s.upstream().outstanding_requests() == 0)
            .unwrap());
        let outcomes = sim.port_mut(Side::Upstream).take_outcomes();
        assert_eq!(outcomes.len(), 16);
        let written = RequestResult::Completed {
            status: CompletionStatus::Successful,
            data: vec![],
        };
        for outcome in outcomes.iter().filter(|o| o.result == written) {
            let fill = (outcome.address / 64) as u8 + 1;
            assert_eq!(
                sim.downstream().memory().read(outcome.address, 32),
                (vec![fill; 32], MemoryStatus::Ok)
            );
        }
        // nothing was written that was not sent
        let untouched = sim.downstream().memory().read(16 * 64, 0x1000 - 16 * 64).0;
        assert!(untouched.iter().all(|b| *b == 0));
        let corrupted = sim.channel_statistics(Side::Upstream).corrupted
            + sim.channel_statistics(Side::Downstream).corrupted;
        assert!(corrupted > 0);
    }

    #[test]
    fn test_seeded_runs_are_deterministic() {
        let run = || {
            let failures = FailureProperties {
                symbol_corruption_rate: 1e-3,
                ..FailureProperties::seeded(42)
            };
            let mut sim = simulation(ChannelProperties::default(), failures);
            sim.run(4_000).unwrap();
            (
                sim.upstream().snapshot(),
                sim.downstream().snapshot(),
                sim.channel_statistics(Side::Upstream),
            )
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_shutdown_stops_stepping() {
        let mut sim = simulation(ChannelProperties::default(), FailureProperties::default());
        sim.run(10).unwrap();
        sim.shutdown();
        assert_eq!(sim.step(), Err(Error::PortShutdown(10)));
    }
}
