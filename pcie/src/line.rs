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

//! 8b/10b line coding for bridges that sample raw serial code groups.
//!
//! Code groups are held in the low ten bits of a `u16`, with bit 9 holding
//! `a`, the first bit on the wire, and bit 0 holding `j`.

use crate::symbol::{ControlCode, Symbol};
use std::collections::HashMap;
use std::fmt;

/// 5b/6b sub-blocks (abcdei) for running disparity negative.
const SIX_BIT_RD_NEG: [u8; 32] = [
    0b100111, 0b011101, 0b101101, 0b110001, 0b110101, 0b101001, 0b011001, 0b111000, //
    0b111001, 0b100101, 0b010101, 0b110100, 0b001101, 0b101100, 0b011100, 0b010111, //
    0b011011, 0b100011, 0b010011, 0b110010, 0b001011, 0b101010, 0b011010, 0b111010, //
    0b110011, 0b100110, 0b010110, 0b110110, 0b001110, 0b101110, 0b011110, 0b101011, //
];

/// 6b sub-block of K28.y for running disparity negative.
const SIX_BIT_K28_RD_NEG: u8 = 0b001111;

/// 3b/4b sub-blocks (fghj) of data symbols for running disparity negative;
/// index 7 is the primary D.x.P7 encoding.
const FOUR_BIT_RD_NEG: [u8; 8] = [
    0b1011, 0b1001, 0b0101, 0b1100, 0b1101, 0b1010, 0b0110, 0b1110,
];

/// 3b/4b sub-blocks of control symbols for running disparity negative.
const FOUR_BIT_K_RD_NEG: [u8; 8] = [
    0b1011, 0b0110, 0b1010, 0b1100, 0b1101, 0b0101, 0b1001, 0b0111,
];

/// D.x.A7 for running disparity negative.
const FOUR_BIT_A7_RD_NEG: u8 = 0b0111;

/// A 10-bit code group.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TenBitCode(pub u16);

impl TenBitCode {
    /// Number of ones minus number of zeros.
    pub fn disparity(self) -> i32 {
        2 * (self.0 & 0x3ff).count_ones() as i32 - 10
    }
}

impl fmt::Display for TenBitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06b} {:04b}", self.0 >> 4, self.0 & 0xf)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RunningDisparity {
    Negative,
    Positive,
}

impl RunningDisparity {
    fn flip(self) -> Self {
        match self {
            RunningDisparity::Negative => RunningDisparity::Positive,
            RunningDisparity::Positive => RunningDisparity::Negative,
        }
    }

    fn after(self, block: u8, bits: u32) -> Self {
        if 2 * block.count_ones() == bits {
            self
        } else {
            self.flip()
        }
    }
}

impl Default for RunningDisparity {
    fn default() -> Self {
        RunningDisparity::Negative
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineError {
    /// The code group is not part of the code.
    InvalidCode(TenBitCode),
    /// The code group is valid, but not for the current running disparity.
    /// The decoded symbol is still reported.
    Disparity(Symbol),
}

fn complement(block: u8, bits: u32) -> u8 {
    !block & ((1u16 << bits) - 1) as u8
}

// Blocks with non-zero disparity, D.07 and x.3 alternate on positive
// running disparity; all others are used as-is.
fn six_bit(rd_neg: u8, rd: RunningDisparity) -> u8 {
    let alternates = 2 * rd_neg.count_ones() != 6 || rd_neg == 0b111000;
    if rd == RunningDisparity::Positive && alternates {
        complement(rd_neg, 6)
    } else {
        rd_neg
    }
}

fn four_bit(rd_neg: u8, rd: RunningDisparity, control: bool) -> u8 {
    let alternates = control || 2 * rd_neg.count_ones() != 4 || rd_neg == 0b1100;
    if rd == RunningDisparity::Positive && alternates {
        complement(rd_neg, 4)
    } else {
        rd_neg
    }
}

/// Encode `symbol` starting at running disparity `rd`. Returns the code
/// group and the running disparity after it, or `None` for electrical idle.
pub fn encode_symbol(symbol: Symbol, rd: RunningDisparity) -> Option<(TenBitCode, RunningDisparity)> {
    let (byte, control) = match symbol {
        Symbol::ElectricalIdle => return None,
        Symbol::Data(byte) => (byte, false),
        Symbol::Control(code) => (code.k_byte(), true),
    };
    let x = (byte & 0x1f) as usize;
    let y = (byte >> 5) as usize;

    let six_rd_neg = if control && x == 28 {
        SIX_BIT_K28_RD_NEG
    } else {
        SIX_BIT_RD_NEG[x]
    };
    let six = six_bit(six_rd_neg, rd);
    let rd = rd.after(six, 6);

    let four_rd_neg = if control {
        FOUR_BIT_K_RD_NEG[y]
    } else if y == 7
        && ((rd == RunningDisparity::Negative && (x == 17 || x == 18 || x == 20))
            || (rd == RunningDisparity::Positive && (x == 11 || x == 13 || x == 14)))
    {
        FOUR_BIT_A7_RD_NEG
    } else {
        FOUR_BIT_RD_NEG[y]
    };
    let four = four_bit(four_rd_neg, rd, control || (y == 7 && four_rd_neg == FOUR_BIT_A7_RD_NEG));
    let rd = rd.after(four, 4);

    Some((TenBitCode(((six as u16) << 4) | four as u16), rd))
}

/// Transmit side of a lane's line coder.
#[derive(Clone, Debug, Default)]
pub struct LineEncoder {
    rd: RunningDisparity,
}

impl LineEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_disparity(&self) -> RunningDisparity {
        self.rd
    }

    /// Electrical idle produces no code group and restarts the encoder at
    /// negative disparity.
    pub fn encode(&mut self, symbol: Symbol) -> Option<TenBitCode> {
        match encode_symbol(symbol, self.rd) {
            Some((code, rd)) => {
                self.rd = rd;
                Some(code)
            }
            None => {
                self.rd = RunningDisparity::Negative;
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Decoding {
    symbol: Symbol,
    rd_in: RunningDisparity,
    rd_out: RunningDisparity,
}

/// Receive side of a lane's line coder.
#[derive(Clone, Debug)]
pub struct LineDecoder {
    table: HashMap<TenBitCode, Vec<Decoding>>,
    /// `None` until the first code group after reset or electrical idle.
    rd: Option<RunningDisparity>,
}

impl LineDecoder {
    pub fn new() -> Self {
        let mut table = HashMap::<TenBitCode, Vec<Decoding>>::new();
        let symbols = (0..=255u8)
            .map(Symbol::Data)
            .chain(ControlCode::ALL.iter().map(|code| Symbol::Control(*code)));
        for symbol in symbols {
            for rd_in in [RunningDisparity::Negative, RunningDisparity::Positive] {
                if let Some((code, rd_out)) = encode_symbol(symbol, rd_in) {
                    table.entry(code).or_default().push(Decoding {
                        symbol,
                        rd_in,
                        rd_out,
                    });
                }
            }
        }
        Self { table, rd: None }
    }

    /// Decode one code group; `None` means the lane is electrically idle.
    pub fn decode(&mut self, code: Option<TenBitCode>) -> Result<Symbol, LineError> {
        let code = match code {
            Some(code) => TenBitCode(code.0 & 0x3ff),
            None => {
                self.rd = None;
                return Ok(Symbol::ElectricalIdle);
            }
        };
        let decodings = self.table.get(&code).ok_or(LineError::InvalidCode(code))?;
        match self.rd {
            None => {
                let rd_out = decodings[0].rd_out;
                self.rd = if decodings.iter().all(|d| d.rd_out == rd_out) {
                    Some(rd_out)
                } else {
                    None
                };
                Ok(decodings[0].symbol)
            }
            Some(rd) => match decodings.iter().find(|d| d.rd_in == rd) {
                Some(decoding) => {
                    self.rd = Some(decoding.rd_out);
                    Ok(decoding.symbol)
                }
                None => {
                    log::debug!("running disparity error on {}", code);
                    self.rd = Some(decodings[0].rd_out);
                    Err(LineError::Disparity(decodings[0].symbol))
                }
            },
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
