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

//! One port of a link, advanced one cycle at a time.
//!
//! Each cycle the inbound lane symbols are decoded first, the training
//! state machine then steps on what was received, received frames go to
//! the data-link layer and from there to the memory model, and finally
//! the outbound lane symbols are encoded for the state just entered.

use crate::codec::{destripe, LinkDecoder, LinkEncoder, Token, TxDirective};
use crate::config::LinkConfiguration;
use crate::dll::{CrcCheck, DataLink, DataLinkStatistics};
use crate::error::Error;
use crate::ltssm::{
    LinkCommand, LinkParameters, Ltssm, LtssmEffect, LtssmInput, LtssmState, LtssmStatistics,
    StateKind,
};
use crate::memory::MemoryModel;
use crate::symbol::{OrderedSet, Symbol};
use crate::transaction::{complete_request, Request, RequestOutcome, Requester, TransactionPacket};
use crate::vcd::{VcdComponent, VcdWriter};
use crate::Cycle;
use itertools::Itertools;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The boundary a cosimulation bridge drives.
pub trait CosimPort {
    /// Start a new lifecycle from electrical idle.
    fn reset(&mut self);

    /// Consume the inbound lane symbols of one cycle and produce the
    /// outbound ones.
    fn step(&mut self, inbound: &[Symbol]) -> Result<Vec<Symbol>, Error>;

    fn shutdown(&mut self);
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkStatistics {
    pub cycles: Cycle,
    pub ltssm: LtssmStatistics,
    pub data_link: DataLinkStatistics,
    /// requests answered from the local memory model
    pub requests_served: usize,
    pub completions_received: usize,
    pub completion_timeouts: usize,
    pub malformed_packets: usize,
    /// framing errors seen outside L0, where they are not reported to the
    /// data-link layer
    pub symbol_errors: usize,
}

/// Read-only view of a port for logging and assertions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkSnapshot {
    pub name: String,
    pub cycle: Cycle,
    /// state with sub-state, e.g. `RECOVERY.RCVR_LOCK`
    pub state: String,
    pub kind: StateKind,
    pub link: Option<LinkParameters>,
    pub lane_reversal: bool,
    pub last_crc_check: Option<CrcCheck>,
    /// summary of the last transaction packet received
    pub last_transaction: Option<String>,
    pub statistics: LinkStatistics,
}

impl fmt::Display for LinkSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{}: {}", self.name, self.cycle, self.state)?;
        if let Some(link) = self.link {
            write!(f, " x{} {}", link.width, link.speed)?;
        }
        if self.lane_reversal {
            f.write_str(" reversed")?;
        }
        let dl = &self.statistics.data_link;
        write!(
            f,
            ", tlps {}/{} (replayed {}), naks {}/{}, lcrc failures {}, recoveries {}, link ups {}",
            dl.tlps_sent,
            dl.tlps_received,
            dl.tlps_replayed,
            dl.naks_sent,
            dl.naks_received,
            dl.lcrc_failures,
            self.statistics.ltssm.recoveries,
            self.statistics.ltssm.link_ups
        )
    }
}

pub struct PcieModel {
    name: String,
    config: LinkConfiguration,
    ltssm: Ltssm,
    decoder: LinkDecoder,
    encoder: LinkEncoder,
    data_link: DataLink,
    memory: MemoryModel,
    requester: Requester,
    cycle: Cycle,
    /// physical lane carrying logical lane 0 when the lanes are reversed
    reversal: Option<usize>,
    last_sent: Option<OrderedSet>,
    command: Option<LinkCommand>,
    retrain: bool,
    outcomes: Vec<RequestOutcome>,
    last_transaction: Option<String>,
    rx_lane0: Symbol,
    tx_lane0: Symbol,
    stats: LinkStatistics,
    shut_down: bool,
}

impl PcieModel {
    pub fn new(name: &str, config: LinkConfiguration) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            ltssm: Ltssm::new(config.ltssm.clone(), config.lanes, config.max_speed),
            decoder: LinkDecoder::new(),
            encoder: LinkEncoder::new(config.lanes as usize, config.codec.skip_interval),
            data_link: DataLink::new(config.data_link.clone(), config.lcrc)?,
            memory: MemoryModel::new(&config.regions)?,
            requester: Requester::new(config.requester_id, config.data_link.completion_timeout),
            cycle: 0,
            reversal: None,
            last_sent: None,
            command: None,
            retrain: false,
            outcomes: Vec::new(),
            last_transaction: None,
            rx_lane0: Symbol::ElectricalIdle,
            tx_lane0: Symbol::ElectricalIdle,
            stats: LinkStatistics::default(),
            shut_down: false,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configuration(&self) -> &LinkConfiguration {
        &self.config
    }

    /// Cycles stepped so far.
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    pub fn state(&self) -> &LtssmState {
        self.ltssm.state()
    }

    pub fn link(&self) -> Option<LinkParameters> {
        self.ltssm.link()
    }

    pub fn is_link_up(&self) -> bool {
        self.ltssm.state().kind() == StateKind::L0
    }

    pub fn memory(&self) -> &MemoryModel {
        &self.memory
    }

    /// Direct access to the backing store, bypassing the link.
    pub fn memory_mut(&mut self) -> &mut MemoryModel {
        &mut self.memory
    }

    pub fn data_link(&self) -> &DataLink {
        &self.data_link
    }

    /// Direct the training state machine; applied on the next step.
    pub fn command(&mut self, command: LinkCommand) {
        log::debug!("{}: command {:?}", self.name, command);
        self.command = Some(command);
    }

    /// Queue a memory read towards the peer and return its tag.
    pub fn submit_read(&mut self, address: u64, length: u32) -> Result<u8, Error> {
        let request = self.requester.read(address, length, self.cycle)?;
        Ok(self.submit(request))
    }

    /// Queue a memory write towards the peer and return its tag.
    pub fn submit_write(&mut self, address: u64, data: Vec<u8>) -> Result<u8, Error> {
        let request = self.requester.write(address, data, self.cycle)?;
        Ok(self.submit(request))
    }

    fn submit(&mut self, request: Request) -> u8 {
        let tag = request.tag;
        let packet = TransactionPacket::Request(request);
        log::debug!("{}: submitting {}", self.name, packet);
        self.data_link.submit(packet.encode());
        tag
    }

    /// Outcomes of locally issued requests, in the order they finished.
    pub fn take_outcomes(&mut self) -> Vec<RequestOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requester.outstanding()
    }

    pub fn statistics(&self) -> LinkStatistics {
        LinkStatistics {
            cycles: self.cycle,
            ltssm: self.ltssm.statistics().clone(),
            data_link: self.data_link.statistics().clone(),
            ..self.stats.clone()
        }
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            name: self.name.clone(),
            cycle: self.cycle,
            state: self.ltssm.state().to_string(),
            kind: self.ltssm.state().kind(),
            link: self.ltssm.link(),
            lane_reversal: self.reversal.is_some(),
            last_crc_check: self.data_link.last_crc_check(),
            last_transaction: self.last_transaction.clone(),
            statistics: self.statistics(),
        }
    }

    fn observe(&mut self, logical: &[Symbol], tokens: &[Token]) -> LtssmInput {
        let sets = tokens
            .iter()
            .filter_map(|token| match token {
                Token::OrderedSet(set) => Some(*set),
                _ => None,
            })
            .collect::<Vec<_>>();
        let received = sets
            .iter()
            .copied()
            .find(|set| *set != OrderedSet::Skip)
            .or_else(|| sets.first().copied());

        // the lane number seen on physical lane 0 tells which way round
        // the lanes are connected
        if let Some(OrderedSet::Ts2(ts)) = received {
            if self.reversal.is_none() && self.ltssm.state().kind() == StateKind::Configuration {
                if let Some(lane) = ts.lane.filter(|lane| *lane != 0) {
                    log::info!("{}: lane reversal, logical lane 0 on lane {}", self.name, lane);
                    self.reversal = Some(lane as usize);
                }
            }
        }

        let retrain = std::mem::replace(&mut self.retrain, false);
        let command = match self.command.take() {
            Some(command) => {
                self.retrain = retrain;
                Some(command)
            }
            None if retrain => Some(LinkCommand::Retrain),
            None => None,
        };

        LtssmInput {
            electrical_idle: logical.first().map_or(true, |s| s.is_electrical_idle()),
            received,
            idle_symbols: tokens.iter().filter(|t| **t == Token::Idle).count(),
            traffic: tokens
                .iter()
                .any(|t| matches!(t, Token::Packet(_) | Token::Nullified(_))),
            sent: self.last_sent.take(),
            command,
        }
    }

    fn link_down(&mut self) {
        log::info!("{}: link down @cycle {}", self.name, self.cycle);
        self.data_link.reset();
        self.decoder.reset();
        self.encoder.reset();
        self.reversal = None;
    }

    fn dispatch(&mut self, tlp: Vec<u8>) {
        match TransactionPacket::decode(&tlp) {
            Ok(TransactionPacket::Request(request)) => {
                let summary = format!("{}", TransactionPacket::Request(request.clone()));
                log::debug!("{}: rx {}", self.name, summary);
                self.last_transaction = Some(summary);
                let completion =
                    complete_request(&mut self.memory, &request, self.config.requester_id);
                self.stats.requests_served += 1;
                self.data_link
                    .submit(TransactionPacket::Completion(completion).encode());
            }
            Ok(TransactionPacket::Completion(completion)) => {
                let summary = format!("{}", TransactionPacket::Completion(completion.clone()));
                log::debug!("{}: rx {}", self.name, summary);
                self.last_transaction = Some(summary);
                self.stats.completions_received += 1;
                if let Some(outcome) = self.requester.complete(completion) {
                    self.outcomes.push(outcome);
                }
            }
            Err(error) => {
                log::warn!("{}: malformed transaction packet: {:?}", self.name, error);
                self.stats.malformed_packets += 1;
            }
        }
    }

    fn deliver(&mut self, tokens: Vec<Token>, accepting: bool) {
        let in_l0 = self.is_link_up();
        for token in tokens {
            match token {
                Token::Packet(frame) if accepting => {
                    if let Some(tlp) = self.data_link.receive(frame) {
                        self.dispatch(tlp);
                    }
                }
                Token::Nullified(_) if accepting => self.data_link.nullified(),
                Token::Packet(_) | Token::Nullified(_) => {
                    log::trace!("{}: dropping frame in {}", self.name, self.ltssm.state());
                }
                Token::FramingError(error) if in_l0 => {
                    log::debug!("{}: framing error: {}", self.name, error);
                    self.data_link.framing_error();
                }
                Token::FramingError(error) => {
                    log::trace!("{}: framing error in {}: {}", self.name, self.ltssm.state(), error);
                    self.stats.symbol_errors += 1;
                }
                _ => {}
            }
        }
        if self.data_link.take_retrain_request() {
            self.retrain = true;
        }
    }
}

impl CosimPort for PcieModel {
    /// Protocol state restarts from Detect; the memory contents and the
    /// cumulative statistics survive.
    fn reset(&mut self) {
        log::info!("{}: reset", self.name);
        self.ltssm.reset();
        self.decoder.reset();
        self.encoder.reset();
        self.data_link.reset();
        let discarded = self.data_link.discard_queued();
        if discarded > 0 {
            log::debug!("{}: reset discards {} queued packets", self.name, discarded);
        }
        self.requester = Requester::new(
            self.config.requester_id,
            self.config.data_link.completion_timeout,
        );
        self.reversal = None;
        self.last_sent = None;
        self.command = None;
        self.retrain = false;
        self.outcomes.clear();
        self.last_transaction = None;
        self.rx_lane0 = Symbol::ElectricalIdle;
        self.tx_lane0 = Symbol::ElectricalIdle;
        self.shut_down = false;
    }

    fn step(&mut self, inbound: &[Symbol]) -> Result<Vec<Symbol>, Error> {
        if self.shut_down {
            return Err(Error::PortShutdown(self.cycle));
        }
        let lanes = self.config.lanes as usize;
        let inbound = inbound
            .iter()
            .copied()
            .chain(std::iter::repeat(Symbol::ElectricalIdle))
            .take(lanes)
            .collect::<Vec<_>>();
        if cfg!(feature = "trace-lane-symbols") {
            log::trace!("{} rx @{}: {}", self.name, self.cycle, inbound.iter().join(" "));
        }

        // training sets only need lane 0 until a width is agreed
        let width = match self.ltssm.link() {
            Some(_) => self.ltssm.active_lanes(),
            None => 1,
        };
        let logical = destripe(&inbound, width, self.reversal);
        let tokens = self.decoder.receive(&logical);
        let input = self.observe(&logical, &tokens);

        let was_accepting = self.ltssm.state().accepts_frames();
        let (directive, effects) = self.ltssm.step(&input);
        if effects.contains(&LtssmEffect::LinkDown) {
            self.link_down();
        }
        if self.ltssm.state().kind() == StateKind::Detect {
            self.reversal = None;
        }

        let accepting = was_accepting || self.ltssm.state().accepts_frames();
        self.deliver(tokens, accepting);
        if self.is_link_up() {
            self.data_link.tick();
        }
        let expired = self.requester.expire(self.cycle);
        self.stats.completion_timeouts += expired.len();
        self.outcomes.extend(expired);

        let echo = directive == TxDirective::Echo
            && !self.encoder.in_ordered_set()
            && !self.encoder.in_frame();
        let data_link = &mut self.data_link;
        let encoded = self
            .encoder
            .cycle(directive, self.ltssm.active_lanes(), || data_link.next_frame());
        self.last_sent = encoded.set_completed;
        let outbound = if echo { inbound.clone() } else { encoded.symbols };
        if cfg!(feature = "trace-lane-symbols") {
            log::trace!("{} tx @{}: {}", self.name, self.cycle, outbound.iter().join(" "));
        }

        self.rx_lane0 = inbound[0];
        self.tx_lane0 = outbound[0];
        self.cycle += 1;
        Ok(outbound)
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            log::info!("shutdown {}", self.snapshot());
            self.shut_down = true;
        }
    }
}

impl VcdComponent for PcieModel {
    fn vcd_write_scope(&self, writer: Rc<RefCell<VcdWriter>>) {
        let _vcd_scope = VcdWriter::managed_decl_scope(Rc::clone(&writer), &self.name);
        let mut writer = writer.borrow_mut();
        writer.add_integer_var::<u8>("ltssm_state");
        writer.add_integer_var::<u8>("link_width");
        writer.add_integer_var::<u16>("tx_seq");
        writer.add_integer_var::<u16>("rx_seq");
        writer.add_integer_var::<u16>("tx_lane0");
        writer.add_integer_var::<u16>("rx_lane0");
    }

    fn vcd_record(&self, writer: Rc<RefCell<VcdWriter>>) {
        let _vcd_scope = VcdWriter::managed_trace_scope(Rc::clone(&writer), &self.name);
        let mut writer = writer.borrow_mut();
        writer.change_vector("ltssm_state", self.ltssm.state().kind().code() as u64);
        match self.ltssm.link() {
            Some(link) => writer.change_vector("link_width", link.width as u64),
            None => writer.change_undefined("link_width"),
        }
        writer.change_vector("tx_seq", self.data_link.transmit_sequence() as u64);
        writer.change_vector("rx_seq", self.data_link.receive_sequence() as u64);
        for (name, symbol) in [("tx_lane0", self.tx_lane0), ("rx_lane0", self.rx_lane0)] {
            if symbol.is_electrical_idle() {
                writer.change_undefined(name);
            } else {
                writer.change_vector(name, symbol.trace_code() as u64);
            }
        }
    }
}
