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

//! Lane symbols and ordered sets.
//!
//! A lane carries exactly one [`Symbol`] per cycle. Data and control
//! symbols are distinct variants, so a data byte can never be mistaken for
//! a control marker by the decoder.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier symbol repeated at the tail of a TS1 ordered set (D10.2).
pub const TS1_IDENTIFIER: u8 = 0x4a;
/// Identifier symbol repeated at the tail of a TS2 ordered set (D5.2).
pub const TS2_IDENTIFIER: u8 = 0x45;

/// Number of symbols in a TS1/TS2 ordered set.
pub const TRAINING_SET_LEN: usize = 16;
/// Number of symbols in SKP, EIOS and FTS ordered sets.
pub const SHORT_SET_LEN: usize = 4;

/// The K-symbols used on the link.
///
/// `Idle` is the logical idle marker sent between packets; it is carried
/// on K28.4, which the other codes leave unused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ControlCode {
    /// K28.5, first symbol of every ordered set
    Com,
    /// K27.7, start of a transaction-layer frame
    Stp,
    /// K28.2, start of a data-link-layer frame
    Sdp,
    /// K29.7, end of a good frame
    End,
    /// K30.7, end of a nullified frame
    Edb,
    /// K23.7, unassigned link/lane number
    Pad,
    /// K28.0
    Skp,
    /// K28.1
    Fts,
    /// K28.3
    Idl,
    /// K28.7
    Eie,
    /// K28.4
    Idle,
}

impl ControlCode {
    pub const ALL: [ControlCode; 11] = [
        ControlCode::Com,
        ControlCode::Stp,
        ControlCode::Sdp,
        ControlCode::End,
        ControlCode::Edb,
        ControlCode::Pad,
        ControlCode::Skp,
        ControlCode::Fts,
        ControlCode::Idl,
        ControlCode::Eie,
        ControlCode::Idle,
    ];

    /// The 8-bit value (HGF EDCBA) of the K-symbol.
    pub fn k_byte(self) -> u8 {
        match self {
            ControlCode::Com => 0xbc,
            ControlCode::Stp => 0xfb,
            ControlCode::Sdp => 0x5c,
            ControlCode::End => 0xfd,
            ControlCode::Edb => 0xfe,
            ControlCode::Pad => 0xf7,
            ControlCode::Skp => 0x1c,
            ControlCode::Fts => 0x3c,
            ControlCode::Idl => 0x7c,
            ControlCode::Eie => 0xfc,
            ControlCode::Idle => 0x9c,
        }
    }

    pub fn from_k_byte(value: u8) -> Option<ControlCode> {
        ControlCode::ALL
            .iter()
            .copied()
            .find(|code| code.k_byte() == value)
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCode::Com => "COM",
            ControlCode::Stp => "STP",
            ControlCode::Sdp => "SDP",
            ControlCode::End => "END",
            ControlCode::Edb => "EDB",
            ControlCode::Pad => "PAD",
            ControlCode::Skp => "SKP",
            ControlCode::Fts => "FTS",
            ControlCode::Idl => "IDL",
            ControlCode::Eie => "EIE",
            ControlCode::Idle => "IDLE",
        };
        f.write_str(name)
    }
}

/// One unit of lane traffic for one cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Symbol {
    /// no signal is driven on the lane
    ElectricalIdle,
    Data(u8),
    Control(ControlCode),
}

impl Symbol {
    /// The logical idle symbol sent between packets.
    pub const IDLE: Symbol = Symbol::Control(ControlCode::Idle);
    pub const COM: Symbol = Symbol::Control(ControlCode::Com);
    pub const PAD: Symbol = Symbol::Control(ControlCode::Pad);

    pub fn is_control(&self) -> bool {
        matches!(self, Symbol::Control(_))
    }

    pub fn is_electrical_idle(&self) -> bool {
        matches!(self, Symbol::ElectricalIdle)
    }

    /// A compact numeric code for waveform dumps: data bytes map to
    /// themselves, K-symbols to `0x100 | k_byte`, electrical idle to 0x3ff.
    pub fn trace_code(&self) -> u16 {
        match self {
            Symbol::ElectricalIdle => 0x3ff,
            Symbol::Data(byte) => *byte as u16,
            Symbol::Control(code) => 0x100 | code.k_byte() as u16,
        }
    }
}

impl Default for Symbol {
    fn default() -> Self {
        Symbol::ElectricalIdle
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::ElectricalIdle => f.write_str("--"),
            Symbol::Data(byte) => write!(f, "{:02x}", byte),
            Symbol::Control(code) => code.fmt(f),
        }
    }
}

/// Signaling rates, in the order they were introduced.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum LinkSpeed {
    Gen1,
    Gen2,
    Gen3,
    Gen4,
    Gen5,
}

impl LinkSpeed {
    const ALL: [LinkSpeed; 5] = [
        LinkSpeed::Gen1,
        LinkSpeed::Gen2,
        LinkSpeed::Gen3,
        LinkSpeed::Gen4,
        LinkSpeed::Gen5,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// The supported-speed bitmask advertised in training sets by a port
    /// whose fastest rate is `self`.
    pub fn supported_mask(self) -> u8 {
        LinkSpeed::ALL
            .iter()
            .filter(|speed| **speed <= self)
            .fold(0, |mask, speed| mask | speed.bit())
    }

    /// Highest rate present in both advertised masks.
    pub fn highest_common(local: u8, remote: u8) -> Option<LinkSpeed> {
        LinkSpeed::ALL
            .iter()
            .rev()
            .copied()
            .find(|speed| local & remote & speed.bit() != 0)
    }
}

impl Default for LinkSpeed {
    fn default() -> Self {
        LinkSpeed::Gen1
    }
}

impl fmt::Display for LinkSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gen{}", *self as u8 + 1)
    }
}

bitflags! {
    /// Training-control bits carried in symbol 5 of TS1/TS2.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TrainingControl: u8 {
        const HOT_RESET = 1 << 0;
        const DISABLE_LINK = 1 << 1;
        const LOOPBACK = 1 << 2;
        const DISABLE_SCRAMBLING = 1 << 3;
    }
}

/// The variable fields of a TS1/TS2 ordered set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TrainingSet {
    /// `None` is sent as PAD.
    pub link: Option<u8>,
    /// Lane number; on transmit each lane substitutes its own index when
    /// lane numbers are assigned.
    pub lane: Option<u8>,
    pub n_fts: u8,
    pub speeds: u8,
    pub control: TrainingControl,
    /// Proposed (or, once trained, negotiated) link width.
    pub width: u8,
}

impl TrainingSet {
    pub fn unassigned(width: u8, speeds: u8) -> Self {
        Self {
            link: None,
            lane: None,
            n_fts: 0,
            speeds,
            control: TrainingControl::empty(),
            width,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OrderedSet {
    Ts1(TrainingSet),
    Ts2(TrainingSet),
    /// clock compensation, COM SKP SKP SKP
    Skip,
    /// COM IDL IDL IDL, sent before a lane goes electrically idle
    ElectricalIdle,
    /// COM FTS FTS FTS
    FastTraining,
}

fn number_symbol(value: Option<u8>) -> Symbol {
    value.map_or(Symbol::PAD, Symbol::Data)
}

fn symbol_number(symbol: Symbol) -> Option<Option<u8>> {
    match symbol {
        Symbol::Data(value) => Some(Some(value)),
        Symbol::Control(ControlCode::Pad) => Some(None),
        _ => None,
    }
}

fn data(symbol: Symbol) -> Option<u8> {
    match symbol {
        Symbol::Data(value) => Some(value),
        _ => None,
    }
}

impl OrderedSet {
    pub fn len(&self) -> usize {
        match self {
            OrderedSet::Ts1(_) | OrderedSet::Ts2(_) => TRAINING_SET_LEN,
            _ => SHORT_SET_LEN,
        }
    }

    pub fn training_set(&self) -> Option<&TrainingSet> {
        match self {
            OrderedSet::Ts1(ts) | OrderedSet::Ts2(ts) => Some(ts),
            _ => None,
        }
    }

    /// Symbol `index` of this set as transmitted on physical lane `lane`.
    pub fn symbol_at(&self, index: usize, lane: u8) -> Symbol {
        assert!(index < self.len(), "ordered set index out of range");
        if index == 0 {
            return Symbol::COM;
        }
        let (ts, identifier) = match self {
            OrderedSet::Skip => return Symbol::Control(ControlCode::Skp),
            OrderedSet::ElectricalIdle => return Symbol::Control(ControlCode::Idl),
            OrderedSet::FastTraining => return Symbol::Control(ControlCode::Fts),
            OrderedSet::Ts1(ts) => (ts, TS1_IDENTIFIER),
            OrderedSet::Ts2(ts) => (ts, TS2_IDENTIFIER),
        };
        match index {
            1 => number_symbol(ts.link),
            2 => number_symbol(ts.lane.map(|_| lane)),
            3 => Symbol::Data(ts.n_fts),
            4 => Symbol::Data(ts.speeds),
            5 => Symbol::Data(ts.control.bits()),
            6 => Symbol::Data(ts.width),
            _ => Symbol::Data(identifier),
        }
    }

    /// All symbols of this set as transmitted on physical lane `lane`.
    pub fn symbols(&self, lane: u8) -> Vec<Symbol> {
        (0..self.len()).map(|i| self.symbol_at(i, lane)).collect()
    }

    /// Length of the set introduced by `COM, second`, or `None` if no
    /// ordered set starts that way.
    pub fn expected_len(second: Symbol) -> Option<usize> {
        match second {
            Symbol::Control(ControlCode::Skp)
            | Symbol::Control(ControlCode::Idl)
            | Symbol::Control(ControlCode::Fts) => Some(SHORT_SET_LEN),
            Symbol::Data(_) | Symbol::Control(ControlCode::Pad) => Some(TRAINING_SET_LEN),
            _ => None,
        }
    }

    /// Parse a complete set (COM included). Returns `None` for malformed
    /// sets.
    pub fn parse(symbols: &[Symbol]) -> Option<OrderedSet> {
        if symbols.len() < 2 || symbols[0] != Symbol::COM {
            return None;
        }
        let repeated = |code: ControlCode| {
            symbols.len() == SHORT_SET_LEN
                && symbols[1..]
                    .iter()
                    .all(|symbol| *symbol == Symbol::Control(code))
        };
        match symbols[1] {
            Symbol::Control(ControlCode::Skp) if repeated(ControlCode::Skp) => {
                return Some(OrderedSet::Skip)
            }
            Symbol::Control(ControlCode::Idl) if repeated(ControlCode::Idl) => {
                return Some(OrderedSet::ElectricalIdle)
            }
            Symbol::Control(ControlCode::Fts) if repeated(ControlCode::Fts) => {
                return Some(OrderedSet::FastTraining)
            }
            _ => {}
        }
        if symbols.len() != TRAINING_SET_LEN {
            return None;
        }
        let ts = TrainingSet {
            link: symbol_number(symbols[1])?,
            lane: symbol_number(symbols[2])?,
            n_fts: data(symbols[3])?,
            speeds: data(symbols[4])?,
            control: TrainingControl::from_bits_truncate(data(symbols[5])?),
            width: data(symbols[6])?,
        };
        let identifier = data(symbols[7])?;
        if symbols[8..].iter().any(|s| *s != Symbol::Data(identifier)) {
            return None;
        }
        match identifier {
            TS1_IDENTIFIER => Some(OrderedSet::Ts1(ts)),
            TS2_IDENTIFIER => Some(OrderedSet::Ts2(ts)),
            _ => None,
        }
    }
}

impl fmt::Display for OrderedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderedSet::Ts1(ts) => write!(f, "TS1(width {}, ctl {:#x})", ts.width, ts.control.bits()),
            OrderedSet::Ts2(ts) => write!(f, "TS2(width {}, ctl {:#x})", ts.width, ts.control.bits()),
            OrderedSet::Skip => f.write_str("SKP"),
            OrderedSet::ElectricalIdle => f.write_str("EIOS"),
            OrderedSet::FastTraining => f.write_str("FTS"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k_bytes_are_distinct() {
        for code in ControlCode::ALL.iter() {
            assert_eq!(ControlCode::from_k_byte(code.k_byte()), Some(*code));
        }
        assert_eq!(ControlCode::from_k_byte(0x00), None);
    }

    #[test]
    fn test_training_set_layout() {
        let ts = TrainingSet {
            link: Some(0),
            lane: Some(0),
            n_fts: 8,
            speeds: LinkSpeed::Gen3.supported_mask(),
            control: TrainingControl::LOOPBACK,
            width: 4,
        };
        let symbols = OrderedSet::Ts2(ts).symbols(3);
        assert_eq!(symbols.len(), TRAINING_SET_LEN);
        assert_eq!(symbols[0], Symbol::COM);
        assert_eq!(symbols[1], Symbol::Data(0));
        // lane number field carries the physical lane index
        assert_eq!(symbols[2], Symbol::Data(3));
        assert_eq!(symbols[4], Symbol::Data(0b111));
        assert_eq!(symbols[6], Symbol::Data(4));
        assert!(symbols[7..].iter().all(|s| *s == Symbol::Data(TS2_IDENTIFIER)));

        let parsed = OrderedSet::parse(&symbols).unwrap();
        assert_eq!(
            parsed,
            OrderedSet::Ts2(TrainingSet {
                lane: Some(3),
                ..ts
            })
        );
    }

    #[test]
    fn test_unassigned_numbers_are_pad() {
        let ts = TrainingSet::unassigned(8, LinkSpeed::Gen1.supported_mask());
        let symbols = OrderedSet::Ts1(ts).symbols(5);
        assert_eq!(symbols[1], Symbol::PAD);
        assert_eq!(symbols[2], Symbol::PAD);
        assert_eq!(OrderedSet::parse(&symbols), Some(OrderedSet::Ts1(ts)));
    }

    #[test]
    fn test_training_control_bits() {
        let control = TrainingControl::DISABLE_LINK | TrainingControl::DISABLE_SCRAMBLING;
        let ts = TrainingSet {
            control,
            ..TrainingSet::unassigned(1, 1)
        };
        let mut symbols = OrderedSet::Ts1(ts).symbols(0);
        assert_eq!(symbols[5], Symbol::Data(0b1010));
        assert_eq!(OrderedSet::parse(&symbols), Some(OrderedSet::Ts1(ts)));

        // reserved bits are ignored on receive
        symbols[5] = Symbol::Data(0xf4);
        let parsed = OrderedSet::parse(&symbols).unwrap();
        let control = parsed.training_set().unwrap().control;
        assert_eq!(control, TrainingControl::LOOPBACK);
        assert!(!control.contains(TrainingControl::HOT_RESET));
    }

    #[test]
    fn test_malformed_sets() {
        let mut symbols = OrderedSet::Ts1(TrainingSet::unassigned(1, 1)).symbols(0);
        symbols[12] = Symbol::Data(0x00);
        assert_eq!(OrderedSet::parse(&symbols), None);
        let skp = [
            Symbol::COM,
            Symbol::Control(ControlCode::Skp),
            Symbol::Control(ControlCode::Skp),
            Symbol::Control(ControlCode::Fts),
        ];
        assert_eq!(OrderedSet::parse(&skp), None);
        assert_eq!(
            OrderedSet::parse(&OrderedSet::Skip.symbols(0)),
            Some(OrderedSet::Skip)
        );
        assert_eq!(OrderedSet::expected_len(Symbol::IDLE), None);
    }

    #[test]
    fn test_speed_negotiation() {
        let gen2 = LinkSpeed::Gen2.supported_mask();
        let gen4 = LinkSpeed::Gen4.supported_mask();
        assert_eq!(LinkSpeed::highest_common(gen2, gen4), Some(LinkSpeed::Gen2));
        assert_eq!(LinkSpeed::highest_common(gen4, gen4), Some(LinkSpeed::Gen4));
        assert_eq!(LinkSpeed::highest_common(0, gen4), None);
    }
}
