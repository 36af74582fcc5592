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

//! Link training and status state machine.
//!
//! The state is an explicit tagged value ([`LtssmState`]) advanced once
//! per cycle by the pure function [`transition`]; [`Ltssm`] only keeps the
//! current state and the negotiated link parameters and applies the
//! effects a transition reports.

mod transition;

pub use transition::{directive, transition};

use crate::codec::TxDirective;
use crate::config::LtssmConfiguration;
use crate::symbol::{LinkSpeed, OrderedSet};
use crate::Cycle;
use std::fmt;

/// Requests from outside the state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkCommand {
    /// retrain through Recovery; only honored in L0
    Retrain,
    Disable,
    /// enter Loopback as master
    Loopback,
    /// restart training from Detect
    Reset,
}

/// Negotiated outcome of Configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkParameters {
    pub width: u8,
    pub speed: LinkSpeed,
}

/// Everything the state machine observes in one cycle.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LtssmInput {
    /// logical lane 0 carried no signal
    pub electrical_idle: bool,
    /// an ordered set completed on logical lane 0
    pub received: Option<OrderedSet>,
    /// logical idle symbols received this cycle
    pub idle_symbols: usize,
    /// frame symbols were received this cycle
    pub traffic: bool,
    /// the ordered set whose last symbol went out in the previous cycle
    pub sent: Option<OrderedSet>,
    pub command: Option<LinkCommand>,
}

/// Coarse state, without sub-state detail.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StateKind {
    Detect,
    Polling,
    Configuration,
    L0,
    Recovery,
    Disabled,
    Loopback,
}

impl StateKind {
    pub fn name(self) -> &'static str {
        match self {
            StateKind::Detect => "DETECT",
            StateKind::Polling => "POLLING",
            StateKind::Configuration => "CONFIGURATION",
            StateKind::L0 => "L0",
            StateKind::Recovery => "RECOVERY",
            StateKind::Disabled => "DISABLED",
            StateKind::Loopback => "LOOPBACK",
        }
    }

    /// Numeric code for waveform traces.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of a TS1/TS2 exchange.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Handshake {
    /// consecutive matching training sets received
    pub received: usize,
    /// training sets sent since the first matching one arrived
    pub sent_after_match: Option<usize>,
}

impl Handshake {
    fn receive(&mut self, matching: bool) {
        if matching {
            self.received += 1;
            self.sent_after_match.get_or_insert(0);
        } else {
            self.received = 0;
        }
    }

    fn sent(&mut self) {
        if let Some(sent) = self.sent_after_match.as_mut() {
            *sent += 1;
        }
    }

    fn complete(&self, config: &LtssmConfiguration) -> bool {
        self.received >= config.ts_exit_count
            && self
                .sent_after_match
                .map_or(false, |sent| sent >= config.ts_sent_after_match)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DetectPhase {
    /// transmitting electrical idle
    Quiet { elapsed: Cycle },
    /// transmitting logical idle, waiting for the peer
    Active,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigurationPhase {
    Exchange(Handshake),
    Idle { idle_received: usize },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    /// width this port currently proposes
    pub proposal: u8,
    /// supported speeds advertised by the peer
    pub remote_speeds: u8,
    pub phase: ConfigurationPhase,
    pub elapsed: Cycle,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecoveryPhase {
    ReceiverLock(Handshake),
    ReceiverConfig(Handshake),
    Idle { idle_received: usize },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recovery {
    pub phase: RecoveryPhase,
    /// cycles spent in the current phase
    pub elapsed: Cycle,
    pub retries: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisabledPhase {
    Announcing { sent: usize },
    ElectricalIdle,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopbackRole {
    Master,
    Slave,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LtssmState {
    Detect(DetectPhase),
    Polling { handshake: Handshake, elapsed: Cycle },
    Configuration(Configuration),
    L0,
    Recovery(Recovery),
    Disabled(DisabledPhase),
    Loopback(LoopbackRole),
}

impl LtssmState {
    pub fn initial() -> Self {
        LtssmState::Detect(DetectPhase::Quiet { elapsed: 0 })
    }

    pub fn kind(&self) -> StateKind {
        match self {
            LtssmState::Detect(_) => StateKind::Detect,
            LtssmState::Polling { .. } => StateKind::Polling,
            LtssmState::Configuration(_) => StateKind::Configuration,
            LtssmState::L0 => StateKind::L0,
            LtssmState::Recovery(_) => StateKind::Recovery,
            LtssmState::Disabled(_) => StateKind::Disabled,
            LtssmState::Loopback(_) => StateKind::Loopback,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// True where received frames are handed to the data-link layer.
    pub fn accepts_frames(&self) -> bool {
        matches!(
            self,
            LtssmState::L0
                | LtssmState::Configuration(Configuration {
                    phase: ConfigurationPhase::Idle { .. },
                    ..
                })
                | LtssmState::Recovery(Recovery {
                    phase: RecoveryPhase::Idle { .. },
                    ..
                })
        )
    }
}

impl fmt::Display for LtssmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sub_state = match self {
            LtssmState::Detect(DetectPhase::Quiet { .. }) => "QUIET",
            LtssmState::Detect(DetectPhase::Active) => "ACTIVE",
            LtssmState::Configuration(c) => match c.phase {
                ConfigurationPhase::Exchange(_) => "EXCHANGE",
                ConfigurationPhase::Idle { .. } => "IDLE",
            },
            LtssmState::Recovery(r) => match r.phase {
                RecoveryPhase::ReceiverLock(_) => "RCVR_LOCK",
                RecoveryPhase::ReceiverConfig(_) => "RCVR_CFG",
                RecoveryPhase::Idle { .. } => "IDLE",
            },
            LtssmState::Disabled(DisabledPhase::Announcing { .. }) => "ANNOUNCE",
            LtssmState::Loopback(LoopbackRole::Master) => "MASTER",
            LtssmState::Loopback(LoopbackRole::Slave) => "SLAVE",
            _ => return f.write_str(self.name()),
        };
        write!(f, "{}.{}", self.name(), sub_state)
    }
}

/// Side effects reported by a transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LtssmEffect {
    /// Configuration agreed on width and speed.
    Negotiated(LinkParameters),
    /// L0 entered from Configuration.
    LinkUp,
    /// L0 entered from Recovery.
    Retrained,
    /// Negotiated parameters are void.
    LinkDown,
    /// a cycle budget ran out in the given state
    Timeout(StateKind),
    /// Recovery restarts its handshake after a timeout
    RecoveryRetry(u32),
}

/// The static inputs of a transition.
#[derive(Clone, Copy, Debug)]
pub struct TrainingContext<'a> {
    pub config: &'a LtssmConfiguration,
    pub lanes: u8,
    /// supported-speed mask advertised by this port
    pub speeds: u8,
    pub link: Option<LinkParameters>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub state: LtssmState,
    pub effects: Vec<LtssmEffect>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LtssmStatistics {
    pub transitions: usize,
    pub link_ups: usize,
    pub recoveries: usize,
    pub timeouts: usize,
}

pub struct Ltssm {
    config: LtssmConfiguration,
    lanes: u8,
    speeds: u8,
    state: LtssmState,
    link: Option<LinkParameters>,
    stats: LtssmStatistics,
}

impl Ltssm {
    pub fn new(config: LtssmConfiguration, lanes: u8, max_speed: LinkSpeed) -> Self {
        Self {
            config,
            lanes,
            speeds: max_speed.supported_mask(),
            state: LtssmState::initial(),
            link: None,
            stats: LtssmStatistics::default(),
        }
    }

    pub fn reset(&mut self) {
        self.state = LtssmState::initial();
        self.link = None;
    }

    pub fn state(&self) -> &LtssmState {
        &self.state
    }

    pub fn link(&self) -> Option<LinkParameters> {
        self.link
    }

    pub fn statistics(&self) -> &LtssmStatistics {
        &self.stats
    }

    /// Lanes that carry symbols: all of them until a width is negotiated.
    pub fn active_lanes(&self) -> usize {
        self.link.map_or(self.lanes, |link| link.width) as usize
    }

    fn context(&self) -> TrainingContext<'_> {
        TrainingContext {
            config: &self.config,
            lanes: self.lanes,
            speeds: self.speeds,
            link: self.link,
        }
    }

    /// Advance one cycle and return what to transmit in it, plus the
    /// effects of the transition.
    pub fn step(&mut self, input: &LtssmInput) -> (TxDirective, Vec<LtssmEffect>) {
        let Transition { state, effects } = transition(&self.state, &self.context(), input);
        for effect in &effects {
            match effect {
                LtssmEffect::Negotiated(link) => {
                    log::info!("negotiated x{} at {}", link.width, link.speed);
                    self.link = Some(*link);
                }
                LtssmEffect::LinkUp => self.stats.link_ups += 1,
                LtssmEffect::Retrained => log::debug!("retrained"),
                LtssmEffect::LinkDown => self.link = None,
                LtssmEffect::Timeout(kind) => {
                    log::warn!("training timeout in {}", kind);
                    self.stats.timeouts += 1;
                }
                LtssmEffect::RecoveryRetry(retries) => {
                    log::debug!("recovery retry {}", retries);
                }
            }
        }
        if state.kind() != self.state.kind() {
            log::info!("{} -> {}", self.state, state);
            self.stats.transitions += 1;
            if state.kind() == StateKind::Recovery {
                self.stats.recoveries += 1;
            }
        }
        self.state = state;
        (directive(&self.state, &self.context()), effects)
    }
}
