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

use crate::lane_outage::simulate_lane_outage;
use crate::retry_exhaustion::simulate_retry_exhaustion;
use crate::symbol_corruption::simulate_symbol_corruption;

mod lane_outage;
mod link;
mod retry_exhaustion;
mod symbol_corruption;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let counter = simulate_symbol_corruption(1e-4, 0x5eed)?;
    log::info!("Symbol corruption: {:?}", counter);

    let exhaustion = simulate_retry_exhaustion(3)?;
    log::info!("Retry exhaustion: {:?}", exhaustion);

    let outage = simulate_lane_outage(0, 3000)?;
    log::info!("Lane outage: {:?}", outage);
    Ok(())
}
