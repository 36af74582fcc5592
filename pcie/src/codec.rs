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

//! Translation between lane symbols and framed packets.
//!
//! A frame is `STP bytes.. END` (transaction frames) or `SDP bytes.. END`
//! (data-link frames); `EDB` in place of `END` nullifies it. Ordered sets
//! start with `COM` and occupy whole cycles: every active lane carries its
//! own copy of the set, so the receive side only tracks lane 0 while a set
//! is in progress. Packet symbols are striped across the active lanes,
//! lane 0 first.
//!
//! The codec knows nothing about CRCs or sequence numbers.

use crate::symbol::{ControlCode, OrderedSet, Symbol, TRAINING_SET_LEN};
use crate::Cycle;
use std::collections::VecDeque;
use std::fmt;

/// Longest frame body the decoder accepts before declaring loss of framing.
pub const MAX_FRAME_LEN: usize = 4096 + 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    /// framed by STP
    Transaction,
    /// framed by SDP
    DataLink,
}

impl FrameKind {
    fn start(self) -> Symbol {
        match self {
            FrameKind::Transaction => Symbol::Control(ControlCode::Stp),
            FrameKind::DataLink => Symbol::Control(ControlCode::Sdp),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FramingError {
    /// a data symbol outside of any frame or ordered set
    UnexpectedData(u8),
    /// a control symbol that cannot appear at this point
    UnexpectedControl(ControlCode),
    /// the lane went electrically idle inside a frame
    ElectricalIdleInFrame,
    MalformedOrderedSet,
    /// no END within `MAX_FRAME_LEN` bytes
    Oversized,
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::UnexpectedData(byte) => write!(f, "unexpected data {:02x}", byte),
            FramingError::UnexpectedControl(code) => write!(f, "unexpected {}", code),
            FramingError::ElectricalIdleInFrame => f.write_str("electrical idle inside frame"),
            FramingError::MalformedOrderedSet => f.write_str("malformed ordered set"),
            FramingError::Oversized => f.write_str("frame without END"),
        }
    }
}

/// One element of the classified receive stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token {
    Packet(Frame),
    /// a frame ended by EDB
    Nullified(FrameKind),
    OrderedSet(OrderedSet),
    Idle,
    ElectricalIdle,
    FramingError(FramingError),
}

/// The symbols of `bytes` framed as `kind`.
pub fn encode(kind: FrameKind, bytes: &[u8]) -> Vec<Symbol> {
    let mut symbols = Vec::with_capacity(bytes.len() + 2);
    symbols.push(kind.start());
    symbols.extend(bytes.iter().map(|b| Symbol::Data(*b)));
    symbols.push(Symbol::Control(ControlCode::End));
    symbols
}

#[derive(Clone, Debug)]
enum DecodeState {
    Between,
    Frame(FrameKind, Vec<u8>),
    OrderedSet(Vec<Symbol>),
}

/// Classifies a single stream of symbols.
///
/// Symbols are pushed one at a time; completed tokens queue up until
/// popped. After a framing error the decoder resynchronizes on the symbol
/// that caused it, so a start-of-frame that cuts off a broken frame still
/// opens the next one.
#[derive(Clone, Debug)]
pub struct SymbolDecoder {
    state: DecodeState,
    tokens: VecDeque<Token>,
}

impl Default for SymbolDecoder {
    fn default() -> Self {
        Self {
            state: DecodeState::Between,
            tokens: VecDeque::new(),
        }
    }
}

fn fits_ordered_set(collected: &[Symbol], next: Symbol) -> bool {
    match collected.len() {
        1 => OrderedSet::expected_len(next).is_some(),
        _ => match (collected[1], next) {
            // short sets repeat their second symbol
            (Symbol::Control(first), _) if first != ControlCode::Pad => next == collected[1],
            // training sets: link and lane numbers may be PAD, all else is data
            (_, Symbol::Control(ControlCode::Pad)) => collected.len() <= 2,
            (_, Symbol::Data(_)) => true,
            _ => false,
        },
    }
}

impl SymbolDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the symbols of an ordered set are being collected.
    pub fn in_ordered_set(&self) -> bool {
        matches!(self.state, DecodeState::OrderedSet(_))
    }

    pub fn in_frame(&self) -> bool {
        matches!(self.state, DecodeState::Frame(..))
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::Between;
        self.tokens.clear();
    }

    pub fn pop(&mut self) -> Option<Token> {
        self.tokens.pop_front()
    }

    fn error(&mut self, error: FramingError) {
        log::trace!("framing error: {}", error);
        self.tokens.push_back(Token::FramingError(error));
    }

    pub fn push(&mut self, symbol: Symbol) {
        let state = std::mem::replace(&mut self.state, DecodeState::Between);
        self.state = match state {
            DecodeState::Between => self.start(symbol),
            DecodeState::Frame(kind, mut bytes) => match symbol {
                Symbol::Data(byte) if bytes.len() < MAX_FRAME_LEN => {
                    bytes.push(byte);
                    DecodeState::Frame(kind, bytes)
                }
                Symbol::Data(_) => {
                    self.error(FramingError::Oversized);
                    DecodeState::Between
                }
                Symbol::Control(ControlCode::End) => {
                    self.tokens.push_back(Token::Packet(Frame::new(kind, bytes)));
                    DecodeState::Between
                }
                Symbol::Control(ControlCode::Edb) => {
                    self.tokens.push_back(Token::Nullified(kind));
                    DecodeState::Between
                }
                Symbol::Control(code) => {
                    self.error(FramingError::UnexpectedControl(code));
                    self.start(symbol)
                }
                Symbol::ElectricalIdle => {
                    self.error(FramingError::ElectricalIdleInFrame);
                    self.start(symbol)
                }
            },
            DecodeState::OrderedSet(ref collected) if !fits_ordered_set(collected, symbol) => {
                self.error(FramingError::MalformedOrderedSet);
                self.start(symbol)
            }
            DecodeState::OrderedSet(mut collected) => {
                collected.push(symbol);
                let expected = OrderedSet::expected_len(collected[1]).unwrap_or(TRAINING_SET_LEN);
                if collected.len() < expected {
                    DecodeState::OrderedSet(collected)
                } else {
                    match OrderedSet::parse(&collected) {
                        Some(set) => self.tokens.push_back(Token::OrderedSet(set)),
                        None => self.error(FramingError::MalformedOrderedSet),
                    }
                    DecodeState::Between
                }
            }
        };
    }

    fn start(&mut self, symbol: Symbol) -> DecodeState {
        match symbol {
            Symbol::ElectricalIdle => {
                self.tokens.push_back(Token::ElectricalIdle);
                DecodeState::Between
            }
            Symbol::Data(byte) => {
                self.error(FramingError::UnexpectedData(byte));
                DecodeState::Between
            }
            Symbol::Control(ControlCode::Idle) => {
                self.tokens.push_back(Token::Idle);
                DecodeState::Between
            }
            Symbol::Control(ControlCode::Com) => DecodeState::OrderedSet(vec![symbol]),
            Symbol::Control(ControlCode::Stp) => {
                DecodeState::Frame(FrameKind::Transaction, Vec::new())
            }
            Symbol::Control(ControlCode::Sdp) => DecodeState::Frame(FrameKind::DataLink, Vec::new()),
            Symbol::Control(code) => {
                self.error(FramingError::UnexpectedControl(code));
                DecodeState::Between
            }
        }
    }
}

/// Lazily classifies a symbol stream; see [`decode`].
pub struct Decode<I> {
    symbols: I,
    decoder: SymbolDecoder,
}

impl<I: Iterator<Item = Symbol>> Iterator for Decode<I> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            if let Some(token) = self.decoder.pop() {
                return Some(token);
            }
            let symbol = self.symbols.next()?;
            self.decoder.push(symbol);
        }
    }
}

/// Classify a single-lane symbol stream into packets and control markers.
/// A frame or ordered set still open when the stream ends is not reported.
pub fn decode<I: IntoIterator<Item = Symbol>>(symbols: I) -> Decode<I::IntoIter> {
    Decode {
        symbols: symbols.into_iter(),
        decoder: SymbolDecoder::new(),
    }
}

/// Reorders received physical lanes into logical lanes `0..width`.
///
/// With lane reversal, `base` is the lane number the peer's training sets
/// carried on physical lane 0; logical lane `i` then arrives on physical
/// lane `base - i`.
pub fn destripe(inbound: &[Symbol], width: usize, reversal: Option<usize>) -> Vec<Symbol> {
    (0..width)
        .map(|lane| {
            let physical = match reversal {
                Some(base) => base.checked_sub(lane),
                None => Some(lane),
            };
            physical
                .and_then(|physical| inbound.get(physical).copied())
                .unwrap_or(Symbol::ElectricalIdle)
        })
        .collect()
}

/// Per-cycle receive path over the logical lanes of a link.
#[derive(Clone, Debug, Default)]
pub struct LinkDecoder {
    decoder: SymbolDecoder,
}

impl LinkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    pub fn in_frame(&self) -> bool {
        self.decoder.in_frame()
    }

    /// Decode one cycle. Ordered-set cycles only consume logical lane 0;
    /// all other cycles consume every lane in order.
    pub fn receive(&mut self, lanes: &[Symbol]) -> Vec<Token> {
        let first = match lanes.first() {
            Some(symbol) => *symbol,
            None => return Vec::new(),
        };
        if self.decoder.in_ordered_set() || (first == Symbol::COM && !self.decoder.in_frame()) {
            self.decoder.push(first);
        } else {
            for symbol in lanes {
                self.decoder.push(*symbol);
            }
        }
        std::iter::from_fn(|| self.decoder.pop()).collect()
    }
}

/// What the transmitter is told to put on the lanes this cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxDirective {
    ElectricalIdle,
    /// logical idle on every active lane
    Idle,
    /// repeat the given ordered set
    OrderedSet(OrderedSet),
    /// frames from the data-link layer, idle when there are none
    Traffic,
    /// retransmit the received lane symbols unchanged
    Echo,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EncodedCycle {
    pub symbols: Vec<Symbol>,
    /// set when the last symbol of an ordered set went out this cycle
    pub set_completed: Option<OrderedSet>,
}

/// Per-cycle transmit path.
///
/// An ordered set, once started, always completes. A frame still in
/// flight when the directive stops being [`TxDirective::Traffic`] is cut
/// off with EDB. SKP ordered sets are inserted every `skip_interval`
/// cycles at the next frame boundary, whatever the directive other than
/// electrical idle.
#[derive(Clone, Debug)]
pub struct LinkEncoder {
    lanes: usize,
    skip_interval: Cycle,
    since_skip: Cycle,
    set: Option<(OrderedSet, usize)>,
    frame: VecDeque<Symbol>,
}

impl LinkEncoder {
    /// A `skip_interval` of zero disables clock compensation.
    pub fn new(lanes: usize, skip_interval: Cycle) -> Self {
        Self {
            lanes,
            skip_interval,
            since_skip: 0,
            set: None,
            frame: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        self.since_skip = 0;
        self.set = None;
        self.frame.clear();
    }

    /// True while a frame is partially transmitted.
    pub fn in_frame(&self) -> bool {
        !self.frame.is_empty()
    }

    /// True while an ordered set is partially transmitted.
    pub fn in_ordered_set(&self) -> bool {
        self.set.is_some()
    }

    fn skip_due(&self) -> bool {
        self.skip_interval > 0 && self.since_skip >= self.skip_interval
    }

    fn emit_set(&mut self, set: OrderedSet, index: usize, active: usize, out: &mut EncodedCycle) {
        for (lane, symbol) in out.symbols.iter_mut().enumerate().take(active) {
            *symbol = set.symbol_at(index, lane as u8);
        }
        if index + 1 == set.len() {
            out.set_completed = Some(set);
        } else {
            self.set = Some((set, index + 1));
        }
    }

    fn start_set(&mut self, set: OrderedSet, active: usize, out: &mut EncodedCycle) {
        if set == OrderedSet::Skip {
            self.since_skip = 0;
        }
        log::trace!("tx {}", set);
        self.emit_set(set, 0, active, out);
    }

    /// Produce the symbols for one cycle on `active` lanes; the remaining
    /// lanes carry electrical idle. `next_frame` is polled whenever a lane
    /// slot is free during traffic.
    pub fn cycle<F>(&mut self, directive: TxDirective, active: usize, mut next_frame: F) -> EncodedCycle
    where
        F: FnMut() -> Option<Frame>,
    {
        let active = active.min(self.lanes);
        self.since_skip = self.since_skip.saturating_add(1);
        let mut out = EncodedCycle {
            symbols: vec![Symbol::ElectricalIdle; self.lanes],
            set_completed: None,
        };

        if let Some((set, index)) = self.set.take() {
            self.emit_set(set, index, active, &mut out);
            return out;
        }
        if self.in_frame() && directive != TxDirective::Traffic {
            log::debug!("aborting frame with {} symbols left", self.frame.len());
            self.frame.clear();
            for symbol in out.symbols.iter_mut().take(active) {
                *symbol = Symbol::IDLE;
            }
            out.symbols[0] = Symbol::Control(ControlCode::Edb);
            return out;
        }

        match directive {
            TxDirective::ElectricalIdle | TxDirective::Echo => {
                self.since_skip = 0;
            }
            _ if self.skip_due() && !self.in_frame() => {
                self.start_set(OrderedSet::Skip, active, &mut out);
            }
            TxDirective::Idle => {
                for symbol in out.symbols.iter_mut().take(active) {
                    *symbol = Symbol::IDLE;
                }
            }
            TxDirective::OrderedSet(set) => self.start_set(set, active, &mut out),
            TxDirective::Traffic => {
                for lane in 0..active {
                    if self.frame.is_empty() && !self.skip_due() {
                        if let Some(frame) = next_frame() {
                            self.frame.extend(encode(frame.kind, &frame.bytes));
                        }
                    }
                    out.symbols[lane] = self.frame.pop_front().unwrap_or(Symbol::IDLE);
                }
            }
        }
        out
    }
}
