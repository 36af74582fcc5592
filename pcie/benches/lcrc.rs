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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use pcie::{Crc, CrcParameters};

// one maximum-size transaction packet with its sequence header
const FRAME_BYTES: usize = 4096 + 2 + 16;
const FRAMES: usize = 1000;

fn frame() -> Vec<u8> {
    (0..FRAME_BYTES).map(|i| (i * 7) as u8).collect()
}

fn lcrc(bench: &mut Bencher) {
    let crc = Crc::new(CrcParameters::LCRC).unwrap();
    let bytes = frame();
    bench.iter(|| {
        for _ in 0..FRAMES {
            bencher::black_box(crc.compute(&bytes));
        }
    });
    bench.bytes = (FRAMES * FRAME_BYTES) as u64;
}

fn dllp_crc(bench: &mut Bencher) {
    let crc = Crc::new(CrcParameters::DLLP_CRC).unwrap();
    // DLLPs are four bytes of content
    let bytes = [0x00, 0x00, 0x0a, 0xbc];
    bench.iter(|| {
        for _ in 0..FRAMES * 100 {
            bencher::black_box(crc.compute(&bytes));
        }
    });
    bench.bytes = (FRAMES * 100 * bytes.len()) as u64;
}

benchmark_group!(benches, lcrc, dllp_crc);
benchmark_main!(benches);
