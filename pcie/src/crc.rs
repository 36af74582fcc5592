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

//! Table-driven cyclic redundancy checks.
//!
//! [`Crc`] is a pure function of its parameters: no state survives
//! between calls to [`Crc::compute`].

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Generator description in the usual parameter-model form.
///
/// `reflect` applies to both the input bytes and the output register.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct CrcParameters {
    pub width: u8,
    pub polynomial: u32,
    pub init: u32,
    pub reflect: bool,
    pub xor_out: u32,
}

impl CrcParameters {
    /// The 32-bit link CRC protecting transaction frames (IEEE 802.3).
    pub const LCRC: CrcParameters = CrcParameters {
        width: 32,
        polynomial: 0x04c1_1db7,
        init: 0xffff_ffff,
        reflect: true,
        xor_out: 0xffff_ffff,
    };

    /// The 16-bit CRC protecting data-link frames.
    pub const DLLP_CRC: CrcParameters = CrcParameters {
        width: 16,
        polynomial: 0x100b,
        init: 0xffff,
        reflect: false,
        xor_out: 0xffff,
    };

    fn mask(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = Error::InvalidPolynomial {
            width: self.width,
            polynomial: self.polynomial,
        };
        if !(8..=32).contains(&self.width) {
            return Err(invalid);
        }
        let mask = self.mask();
        // without the x^0 term single-bit errors in the last position go
        // undetected
        if self.polynomial & 1 == 0
            || self.polynomial & !mask != 0
            || self.init & !mask != 0
            || self.xor_out & !mask != 0
        {
            return Err(invalid);
        }
        Ok(())
    }
}

impl Default for CrcParameters {
    fn default() -> Self {
        CrcParameters::LCRC
    }
}

#[derive(Clone, Debug)]
pub struct Crc {
    parameters: CrcParameters,
    table: [u32; 256],
}

impl Crc {
    pub fn new(parameters: CrcParameters) -> Result<Self, Error> {
        parameters.validate()?;
        let mut table = [0u32; 256];
        if parameters.reflect {
            let polynomial = parameters.polynomial.reverse_bits() >> (32 - parameters.width);
            for (i, entry) in table.iter_mut().enumerate() {
                let mut crc = i as u32;
                for _ in 0..8 {
                    crc = if crc & 1 != 0 {
                        (crc >> 1) ^ polynomial
                    } else {
                        crc >> 1
                    };
                }
                *entry = crc;
            }
        } else {
            // the register is kept left-aligned in 32 bits
            let polynomial = parameters.polynomial << (32 - parameters.width);
            for (i, entry) in table.iter_mut().enumerate() {
                let mut crc = (i as u32) << 24;
                for _ in 0..8 {
                    crc = if crc & 0x8000_0000 != 0 {
                        (crc << 1) ^ polynomial
                    } else {
                        crc << 1
                    };
                }
                *entry = crc;
            }
        }
        Ok(Self { parameters, table })
    }

    pub fn parameters(&self) -> &CrcParameters {
        &self.parameters
    }

    /// Width of the check value in bytes.
    pub fn byte_len(&self) -> usize {
        (self.parameters.width as usize + 7) / 8
    }

    pub fn compute(&self, bytes: &[u8]) -> u32 {
        let p = &self.parameters;
        let shift = 32 - p.width as u32;
        let register = if p.reflect {
            let mut register = p.init.reverse_bits() >> shift;
            for byte in bytes {
                register =
                    self.table[((register ^ *byte as u32) & 0xff) as usize] ^ (register >> 8);
            }
            register
        } else {
            let mut register = p.init << shift;
            for byte in bytes {
                register = (register << 8)
                    ^ self.table[(((register >> 24) ^ *byte as u32) & 0xff) as usize];
            }
            register >> shift
        };
        (register ^ p.xor_out) & p.mask()
    }

    pub fn verify(&self, bytes: &[u8], checksum: u32) -> bool {
        self.compute(bytes) == checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn test_catalog_check_values() {
        let lcrc = Crc::new(CrcParameters::LCRC).unwrap();
        assert_eq!(lcrc.compute(CHECK), 0xcbf4_3926);
        assert_eq!(lcrc.byte_len(), 4);

        let bzip2 = Crc::new(CrcParameters {
            reflect: false,
            ..CrcParameters::LCRC
        })
        .unwrap();
        assert_eq!(bzip2.compute(CHECK), 0xfc89_1918);

        let ccitt_false = Crc::new(CrcParameters {
            width: 16,
            polynomial: 0x1021,
            init: 0xffff,
            reflect: false,
            xor_out: 0,
        })
        .unwrap();
        assert_eq!(ccitt_false.compute(CHECK), 0x29b1);

        let kermit = Crc::new(CrcParameters {
            width: 16,
            polynomial: 0x1021,
            init: 0,
            reflect: true,
            xor_out: 0,
        })
        .unwrap();
        assert_eq!(kermit.compute(CHECK), 0x2189);
        assert_eq!(kermit.byte_len(), 2);
    }

    #[test]
    fn test_unreflected_zero_init() {
        let xmodem = Crc::new(CrcParameters {
            width: 16,
            polynomial: 0x1021,
            init: 0,
            reflect: false,
            xor_out: 0,
        })
        .unwrap();
        assert_eq!(xmodem.compute(CHECK), 0x31c3);
        assert!(xmodem.verify(CHECK, 0x31c3));
        assert_eq!(xmodem.compute(b"A"), 0x58e5);

        let mut corrupted = CHECK.to_vec();
        corrupted[4] ^= 0x10;
        assert!(!xmodem.verify(&corrupted, 0x31c3));
    }

    #[test]
    fn test_compute_is_pure() {
        let lcrc = Crc::new(CrcParameters::LCRC).unwrap();
        let first = lcrc.compute(b"payload");
        lcrc.compute(b"something else");
        assert_eq!(lcrc.compute(b"payload"), first);
        assert_eq!(lcrc.compute(&[]), 0);
    }

    #[test]
    fn test_single_bit_flips_are_detected() {
        let payload = (0..64u8).map(|b| b.wrapping_mul(37)).collect::<Vec<_>>();
        for parameters in [CrcParameters::LCRC, CrcParameters::DLLP_CRC] {
            let crc = Crc::new(parameters).unwrap();
            let checksum = crc.compute(&payload);
            assert!(crc.verify(&payload, checksum));
            for bit in 0..payload.len() * 8 {
                let mut corrupted = payload.clone();
                corrupted[bit / 8] ^= 1 << (bit % 8);
                assert!(
                    !crc.verify(&corrupted, checksum),
                    "flip of bit {} undetected",
                    bit
                );
            }
        }
    }

    #[test]
    fn test_invalid_parameters() {
        let even = CrcParameters {
            polynomial: 0x04c1_1db6,
            ..CrcParameters::LCRC
        };
        assert_eq!(
            Crc::new(even).unwrap_err(),
            Error::InvalidPolynomial {
                width: 32,
                polynomial: 0x04c1_1db6
            }
        );
        let narrow = CrcParameters {
            width: 4,
            polynomial: 0x3,
            init: 0,
            reflect: false,
            xor_out: 0,
        };
        assert!(Crc::new(narrow).is_err());
        let too_wide = CrcParameters {
            polynomial: 0x1_100b,
            ..CrcParameters::DLLP_CRC
        };
        assert!(Crc::new(too_wide).is_err());
    }
}
