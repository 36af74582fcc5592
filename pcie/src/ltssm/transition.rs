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

use super::{
    Configuration, ConfigurationPhase, DetectPhase, DisabledPhase, Handshake, LinkCommand,
    LinkParameters, LoopbackRole, LtssmEffect, LtssmInput, LtssmState, Recovery, RecoveryPhase,
    StateKind, TrainingContext, Transition,
};
use crate::codec::TxDirective;
use crate::symbol::{OrderedSet, TrainingControl, TrainingSet};

fn training_set(set: Option<&OrderedSet>) -> Option<&TrainingSet> {
    set.and_then(|set| set.training_set())
}

/// The peer can direct this port through the control bits of its
/// training sets.
fn directed_by_peer(received: Option<&OrderedSet>) -> Option<LtssmState> {
    let control = training_set(received)?.control;
    if control.contains(TrainingControl::HOT_RESET) {
        Some(LtssmState::initial())
    } else if control.contains(TrainingControl::DISABLE_LINK) {
        Some(LtssmState::Disabled(DisabledPhase::ElectricalIdle))
    } else if control.contains(TrainingControl::LOOPBACK) {
        Some(LtssmState::Loopback(LoopbackRole::Slave))
    } else {
        None
    }
}

fn commanded(command: Option<LinkCommand>) -> Option<LtssmState> {
    match command? {
        LinkCommand::Disable => Some(LtssmState::Disabled(DisabledPhase::Announcing { sent: 0 })),
        LinkCommand::Loopback => Some(LtssmState::Loopback(LoopbackRole::Master)),
        LinkCommand::Retrain | LinkCommand::Reset => None,
    }
}

/// Count a received set towards a handshake that accepts `accept` sets.
/// SKP sets are transparent; any other set breaks the run.
fn count_received<F>(handshake: &mut Handshake, input: &LtssmInput, accept: F)
where
    F: Fn(&OrderedSet) -> bool,
{
    match &input.received {
        Some(OrderedSet::Skip) => {}
        Some(set) => handshake.receive(accept(set)),
        None if input.electrical_idle => handshake.receive(false),
        None => {}
    }
}

fn recovery() -> LtssmState {
    LtssmState::Recovery(Recovery {
        phase: RecoveryPhase::ReceiverLock(Handshake::default()),
        elapsed: 0,
        retries: 0,
    })
}

fn detect(phase: &DetectPhase, context: &TrainingContext<'_>, input: &LtssmInput) -> LtssmState {
    match phase {
        DetectPhase::Quiet { elapsed } if elapsed + 1 >= context.config.detect_quiet_cycles => {
            LtssmState::Detect(DetectPhase::Active)
        }
        DetectPhase::Quiet { elapsed } => LtssmState::Detect(DetectPhase::Quiet {
            elapsed: elapsed + 1,
        }),
        DetectPhase::Active if !input.electrical_idle => LtssmState::Polling {
            handshake: Handshake::default(),
            elapsed: 0,
        },
        DetectPhase::Active => LtssmState::Detect(DetectPhase::Active),
    }
}

fn polling(
    handshake: &Handshake,
    elapsed: usize,
    context: &TrainingContext<'_>,
    input: &LtssmInput,
    effects: &mut Vec<LtssmEffect>,
) -> LtssmState {
    if elapsed >= context.config.polling_timeout {
        effects.push(LtssmEffect::Timeout(StateKind::Polling));
        return LtssmState::initial();
    }
    if let Some(state) = commanded(input.command).or_else(|| directed_by_peer(input.received.as_ref())) {
        return state;
    }
    let mut handshake = handshake.clone();
    count_received(&mut handshake, input, |set| set.training_set().is_some());
    if let Some(OrderedSet::Ts1(_)) = input.sent {
        handshake.sent();
    }
    if handshake.complete(context.config) {
        return LtssmState::Configuration(Configuration {
            proposal: context.lanes,
            remote_speeds: 0,
            phase: ConfigurationPhase::Exchange(Handshake::default()),
            elapsed: 0,
        });
    }
    LtssmState::Polling {
        handshake,
        elapsed: elapsed + 1,
    }
}

fn configuration(
    current: &Configuration,
    context: &TrainingContext<'_>,
    input: &LtssmInput,
    effects: &mut Vec<LtssmEffect>,
) -> LtssmState {
    let config = context.config;
    if current.elapsed >= config.configuration_timeout {
        effects.push(LtssmEffect::Timeout(StateKind::Configuration));
        return LtssmState::initial();
    }
    if let Some(state) = commanded(input.command).or_else(|| directed_by_peer(input.received.as_ref())) {
        return state;
    }
    let mut next = current.clone();
    next.elapsed += 1;
    next.phase = match &current.phase {
        ConfigurationPhase::Exchange(handshake) => {
            let mut handshake = handshake.clone();
            if let Some(OrderedSet::Ts2(ts)) = &input.received {
                // the link trains to the narrower of the two proposals
                next.proposal = next.proposal.min(ts.width).max(1);
                next.remote_speeds = ts.speeds;
            }
            let proposal = next.proposal;
            count_received(&mut handshake, input, |set| {
                matches!(set, OrderedSet::Ts2(ts) if ts.width == proposal)
            });
            if let Some(OrderedSet::Ts2(ts)) = &input.sent {
                if ts.width == proposal {
                    handshake.sent();
                }
            }
            if handshake.complete(config) {
                let speed = crate::symbol::LinkSpeed::highest_common(context.speeds, next.remote_speeds)
                    .unwrap_or_default();
                effects.push(LtssmEffect::Negotiated(LinkParameters {
                    width: proposal,
                    speed,
                }));
                ConfigurationPhase::Idle { idle_received: 0 }
            } else {
                ConfigurationPhase::Exchange(handshake)
            }
        }
        ConfigurationPhase::Idle { idle_received } => {
            let idle_received = if training_set(input.received.as_ref()).is_some() {
                0
            } else {
                idle_received + input.idle_symbols
            };
            if idle_received >= config.idle_exit_count || input.traffic {
                effects.push(LtssmEffect::LinkUp);
                return LtssmState::L0;
            }
            ConfigurationPhase::Idle { idle_received }
        }
    };
    LtssmState::Configuration(next)
}

fn l0(input: &LtssmInput) -> LtssmState {
    if input.command == Some(LinkCommand::Retrain) {
        return recovery();
    }
    if let Some(state) = commanded(input.command).or_else(|| directed_by_peer(input.received.as_ref())) {
        return state;
    }
    match input.received {
        Some(OrderedSet::Ts1(_)) | Some(OrderedSet::Ts2(_)) | Some(OrderedSet::ElectricalIdle) => {
            recovery()
        }
        _ if input.electrical_idle => recovery(),
        _ => LtssmState::L0,
    }
}

fn recovery_step(
    current: &Recovery,
    context: &TrainingContext<'_>,
    input: &LtssmInput,
    effects: &mut Vec<LtssmEffect>,
) -> LtssmState {
    let config = context.config;
    if current.elapsed >= config.recovery_timeout {
        let retries = current.retries + 1;
        if retries > config.recovery_retry_limit {
            effects.push(LtssmEffect::Timeout(StateKind::Recovery));
            return LtssmState::initial();
        }
        effects.push(LtssmEffect::RecoveryRetry(retries));
        return LtssmState::Recovery(Recovery {
            phase: RecoveryPhase::ReceiverLock(Handshake::default()),
            elapsed: 0,
            retries,
        });
    }
    if let Some(state) = commanded(input.command).or_else(|| directed_by_peer(input.received.as_ref())) {
        return state;
    }
    if let Some(ts) = training_set(input.received.as_ref()) {
        if ts.link.is_none() {
            log::debug!("peer restarted training");
            return LtssmState::initial();
        }
    }

    let (phase, elapsed) = match &current.phase {
        RecoveryPhase::ReceiverLock(handshake) => {
            let mut handshake = handshake.clone();
            count_received(&mut handshake, input, |set| set.training_set().is_some());
            if let Some(OrderedSet::Ts1(_)) = input.sent {
                handshake.sent();
            }
            if handshake.complete(config) {
                (RecoveryPhase::ReceiverConfig(Handshake::default()), 0)
            } else {
                (RecoveryPhase::ReceiverLock(handshake), current.elapsed + 1)
            }
        }
        RecoveryPhase::ReceiverConfig(handshake) => {
            let mut handshake = handshake.clone();
            count_received(&mut handshake, input, |set| matches!(set, OrderedSet::Ts2(_)));
            if let Some(OrderedSet::Ts2(_)) = input.sent {
                handshake.sent();
            }
            if handshake.complete(config) {
                (RecoveryPhase::Idle { idle_received: 0 }, 0)
            } else {
                (RecoveryPhase::ReceiverConfig(handshake), current.elapsed + 1)
            }
        }
        RecoveryPhase::Idle { idle_received } => {
            let idle_received = if training_set(input.received.as_ref()).is_some() {
                0
            } else {
                idle_received + input.idle_symbols
            };
            if idle_received >= config.idle_exit_count || input.traffic {
                effects.push(LtssmEffect::Retrained);
                return LtssmState::L0;
            }
            (RecoveryPhase::Idle { idle_received }, current.elapsed + 1)
        }
    };
    LtssmState::Recovery(Recovery {
        phase,
        elapsed,
        retries: current.retries,
    })
}

/// Next state for one cycle. Pure: the same state, context and input
/// always give the same transition.
pub fn transition(
    state: &LtssmState,
    context: &TrainingContext<'_>,
    input: &LtssmInput,
) -> Transition {
    let mut effects = Vec::new();
    let next = if input.command == Some(LinkCommand::Reset) {
        LtssmState::initial()
    } else {
        match state {
            LtssmState::Detect(phase) => detect(phase, context, input),
            LtssmState::Polling { handshake, elapsed } => {
                polling(handshake, *elapsed, context, input, &mut effects)
            }
            LtssmState::Configuration(current) => {
                configuration(current, context, input, &mut effects)
            }
            LtssmState::L0 => l0(input),
            LtssmState::Recovery(current) => recovery_step(current, context, input, &mut effects),
            LtssmState::Disabled(DisabledPhase::Announcing { sent }) => {
                let sent = match input.sent {
                    Some(OrderedSet::Ts1(_)) => sent + 1,
                    _ => *sent,
                };
                if sent >= context.config.announce_count {
                    LtssmState::Disabled(DisabledPhase::ElectricalIdle)
                } else {
                    LtssmState::Disabled(DisabledPhase::Announcing { sent })
                }
            }
            LtssmState::Disabled(DisabledPhase::ElectricalIdle) => {
                LtssmState::Disabled(DisabledPhase::ElectricalIdle)
            }
            LtssmState::Loopback(LoopbackRole::Slave) if input.electrical_idle => {
                LtssmState::initial()
            }
            LtssmState::Loopback(role) => LtssmState::Loopback(*role),
        }
    };
    if next.kind() == StateKind::Detect && context.link.is_some() {
        effects.push(LtssmEffect::LinkDown);
    }
    Transition {
        state: next,
        effects,
    }
}

/// What `state` transmits.
pub fn directive(state: &LtssmState, context: &TrainingContext<'_>) -> TxDirective {
    let unassigned = TrainingSet {
        n_fts: context.config.n_fts,
        ..TrainingSet::unassigned(context.lanes, context.speeds)
    };
    let assigned = |width: u8| TrainingSet {
        link: Some(0),
        lane: Some(0),
        width,
        ..unassigned
    };
    let trained = match context.link {
        Some(link) => assigned(link.width),
        None => unassigned,
    };
    let with_control = |control: TrainingControl| TrainingSet {
        control: trained.control | control,
        ..trained
    };
    match state {
        LtssmState::Detect(DetectPhase::Quiet { .. }) => TxDirective::ElectricalIdle,
        LtssmState::Detect(DetectPhase::Active) => TxDirective::Idle,
        LtssmState::Polling { .. } => TxDirective::OrderedSet(OrderedSet::Ts1(unassigned)),
        LtssmState::Configuration(Configuration {
            phase: ConfigurationPhase::Exchange(_),
            proposal,
            ..
        }) => TxDirective::OrderedSet(OrderedSet::Ts2(assigned(*proposal))),
        LtssmState::Configuration(_) => TxDirective::Idle,
        LtssmState::L0 => TxDirective::Traffic,
        LtssmState::Recovery(recovery) => match recovery.phase {
            RecoveryPhase::ReceiverLock(_) => TxDirective::OrderedSet(OrderedSet::Ts1(trained)),
            RecoveryPhase::ReceiverConfig(_) => TxDirective::OrderedSet(OrderedSet::Ts2(trained)),
            RecoveryPhase::Idle { .. } => TxDirective::Idle,
        },
        LtssmState::Disabled(DisabledPhase::Announcing { .. }) => TxDirective::OrderedSet(
            OrderedSet::Ts1(with_control(TrainingControl::DISABLE_LINK)),
        ),
        LtssmState::Disabled(DisabledPhase::ElectricalIdle) => TxDirective::ElectricalIdle,
        LtssmState::Loopback(LoopbackRole::Master) => {
            TxDirective::OrderedSet(OrderedSet::Ts1(with_control(TrainingControl::LOOPBACK)))
        }
        LtssmState::Loopback(LoopbackRole::Slave) => TxDirective::Echo,
    }
}
