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

//! Sequencing, acknowledgement and replay of transaction frames.
//!
//! Transaction frame body: `seq[15:0] tlp.. lcrc` where only the low 12
//! bits of the sequence field are used and the LCRC covers the sequence
//! field and the TLP. Data-link frames (DLLPs) are six bytes:
//! `type 0 seq[11:8] seq[7:0] crc16`.

use crate::codec::{Frame, FrameKind};
use crate::config::DataLinkConfiguration;
use crate::crc::{Crc, CrcParameters};
use crate::error::Error;
use crate::Cycle;
use std::collections::VecDeque;
use std::fmt;

/// Sequence numbers count modulo this value.
pub const SEQUENCE_MODULUS: u16 = 4096;

const DLLP_ACK: u8 = 0x00;
const DLLP_NAK: u8 = 0x10;
const DLLP_LEN: usize = 6;
const SEQUENCE_LEN: usize = 2;

fn seq_add(seq: u16, n: u16) -> u16 {
    (seq + n) % SEQUENCE_MODULUS
}

/// How far `to` is ahead of `from`.
fn seq_distance(from: u16, to: u16) -> u16 {
    (to + SEQUENCE_MODULUS - from) % SEQUENCE_MODULUS
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dllp {
    /// all frames up to and including the sequence number arrived
    Ack(u16),
    /// like `Ack`, and everything after it must be replayed
    Nak(u16),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DllpError {
    Length(usize),
    Crc,
    UnknownType(u8),
}

impl Dllp {
    fn encode(self, crc: &Crc) -> Vec<u8> {
        let (kind, seq) = match self {
            Dllp::Ack(seq) => (DLLP_ACK, seq),
            Dllp::Nak(seq) => (DLLP_NAK, seq),
        };
        let mut bytes = vec![kind, 0, (seq >> 8) as u8 & 0x0f, seq as u8];
        let checksum = crc.compute(&bytes) as u16;
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes
    }

    fn decode(bytes: &[u8], crc: &Crc) -> Result<Dllp, DllpError> {
        if bytes.len() != DLLP_LEN {
            return Err(DllpError::Length(bytes.len()));
        }
        let checksum = u16::from_be_bytes([bytes[4], bytes[5]]) as u32;
        if !crc.verify(&bytes[..4], checksum) {
            return Err(DllpError::Crc);
        }
        let seq = u16::from_be_bytes([bytes[2] & 0x0f, bytes[3]]);
        match bytes[0] {
            DLLP_ACK => Ok(Dllp::Ack(seq)),
            DLLP_NAK => Ok(Dllp::Nak(seq)),
            kind => Err(DllpError::UnknownType(kind)),
        }
    }
}

impl fmt::Display for Dllp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dllp::Ack(seq) => write!(f, "Ack({})", seq),
            Dllp::Nak(seq) => write!(f, "Nak({})", seq),
        }
    }
}

/// Result of the most recent LCRC check on a received frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CrcCheck {
    pub sequence: u16,
    pub passed: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DataLinkStatistics {
    pub tlps_sent: usize,
    pub tlps_replayed: usize,
    pub tlps_received: usize,
    pub duplicates: usize,
    pub lcrc_failures: usize,
    pub sequence_gaps: usize,
    pub dllp_errors: usize,
    pub nullified: usize,
    pub framing_errors: usize,
    pub acks_sent: usize,
    pub acks_received: usize,
    pub naks_sent: usize,
    pub naks_received: usize,
    pub replays: usize,
    pub replay_timeouts: usize,
    pub retrain_requests: usize,
}

#[derive(Clone, Debug)]
struct RetryEntry {
    seq: u16,
    bytes: Vec<u8>,
}

pub struct DataLink {
    config: DataLinkConfiguration,
    lcrc: Crc,
    dllp_crc: Crc,

    // transmit side
    next_seq: u16,
    acked_seq: u16,
    retry_buffer: VecDeque<RetryEntry>,
    /// next retry buffer entry to replay
    replay_cursor: Option<usize>,
    replay_timer: Cycle,
    replay_count: u32,
    pending: VecDeque<Vec<u8>>,

    // receive side
    expected_seq: u16,
    nak_scheduled: bool,
    send_nak: bool,
    send_ack: bool,
    unacked: usize,

    retrain_requested: bool,
    last_crc_check: Option<CrcCheck>,
    stats: DataLinkStatistics,
}

impl DataLink {
    pub fn new(config: DataLinkConfiguration, lcrc: CrcParameters) -> Result<Self, Error> {
        Ok(Self {
            config,
            lcrc: Crc::new(lcrc)?,
            dllp_crc: Crc::new(CrcParameters::DLLP_CRC)?,
            next_seq: 0,
            acked_seq: SEQUENCE_MODULUS - 1,
            retry_buffer: VecDeque::new(),
            replay_cursor: None,
            replay_timer: 0,
            replay_count: 0,
            pending: VecDeque::new(),
            expected_seq: 0,
            nak_scheduled: false,
            send_nak: false,
            send_ack: false,
            unacked: 0,
            retrain_requested: false,
            last_crc_check: None,
            stats: DataLinkStatistics::default(),
        })
    }

    /// Drop all link state after the link went down. Transaction packets
    /// not yet given a sequence number stay queued.
    pub fn reset(&mut self) {
        if !self.retry_buffer.is_empty() {
            log::debug!("link down discards {} unacknowledged frames", self.retry_buffer.len());
        }
        self.next_seq = 0;
        self.acked_seq = SEQUENCE_MODULUS - 1;
        self.retry_buffer.clear();
        self.replay_cursor = None;
        self.replay_timer = 0;
        self.replay_count = 0;
        self.expected_seq = 0;
        self.nak_scheduled = false;
        self.send_nak = false;
        self.send_ack = false;
        self.unacked = 0;
        self.retrain_requested = false;
    }

    /// Queue a transaction packet for transmission.
    pub fn submit(&mut self, tlp: Vec<u8>) {
        self.pending.push_back(tlp);
    }

    pub fn statistics(&self) -> &DataLinkStatistics {
        &self.stats
    }

    pub fn last_crc_check(&self) -> Option<CrcCheck> {
        self.last_crc_check
    }

    /// Sequence number the next new frame will carry.
    pub fn transmit_sequence(&self) -> u16 {
        self.next_seq
    }

    /// Sequence number expected on the next received frame.
    pub fn receive_sequence(&self) -> u16 {
        self.expected_seq
    }

    pub fn unacknowledged(&self) -> usize {
        self.retry_buffer.len()
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Drop the transaction packets still waiting for a sequence number.
    pub fn discard_queued(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }

    /// True once after the replay counter ran out or framing was lost.
    pub fn take_retrain_request(&mut self) -> bool {
        std::mem::replace(&mut self.retrain_requested, false)
    }

    fn schedule_nak(&mut self) {
        if !self.nak_scheduled {
            self.nak_scheduled = true;
            self.send_nak = true;
        }
    }

    /// Process a received frame, returning the TLP it delivers, if any.
    pub fn receive(&mut self, frame: Frame) -> Option<Vec<u8>> {
        match frame.kind {
            FrameKind::Transaction => self.receive_tlp(frame.bytes),
            FrameKind::DataLink => {
                self.receive_dllp(&frame.bytes);
                None
            }
        }
    }

    /// A frame was ended with EDB.
    pub fn nullified(&mut self) {
        self.stats.nullified += 1;
    }

    /// The receiver lost framing: whatever frame was in progress is
    /// treated as corrupt and the link retrains.
    pub fn framing_error(&mut self) {
        self.stats.framing_errors += 1;
        self.schedule_nak();
        if !self.retrain_requested {
            self.stats.retrain_requests += 1;
        }
        self.retrain_requested = true;
    }

    fn receive_tlp(&mut self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        let crc_len = self.lcrc.byte_len();
        if bytes.len() < SEQUENCE_LEN + crc_len {
            log::debug!("runt transaction frame of {} bytes", bytes.len());
            self.last_crc_check = Some(CrcCheck {
                sequence: self.expected_seq,
                passed: false,
            });
            self.stats.lcrc_failures += 1;
            self.schedule_nak();
            return None;
        }
        let (body, trailer) = bytes.split_at(bytes.len() - crc_len);
        let received = trailer
            .iter()
            .fold(0u32, |checksum, byte| checksum << 8 | *byte as u32);
        let seq = u16::from_be_bytes([body[0], body[1]]) & 0x0fff;
        let passed = self.lcrc.verify(body, received);
        self.last_crc_check = Some(CrcCheck {
            sequence: seq,
            passed,
        });
        if !passed {
            log::debug!("LCRC failure on frame {}", seq);
            self.stats.lcrc_failures += 1;
            self.schedule_nak();
            return None;
        }
        if seq == self.expected_seq {
            self.expected_seq = seq_add(seq, 1);
            self.nak_scheduled = false;
            self.unacked += 1;
            self.stats.tlps_received += 1;
            return Some(body[SEQUENCE_LEN..].to_vec());
        }
        if seq_distance(seq, self.expected_seq) < SEQUENCE_MODULUS / 2 {
            log::trace!("duplicate frame {} (expecting {})", seq, self.expected_seq);
            self.stats.duplicates += 1;
            self.send_ack = true;
        } else {
            log::debug!("sequence gap: got {}, expecting {}", seq, self.expected_seq);
            self.stats.sequence_gaps += 1;
            self.schedule_nak();
        }
        None
    }

    fn receive_dllp(&mut self, bytes: &[u8]) {
        let dllp = match Dllp::decode(bytes, &self.dllp_crc) {
            Ok(dllp) => dllp,
            Err(error) => {
                log::debug!("discarding data-link frame: {:?}", error);
                self.stats.dllp_errors += 1;
                return;
            }
        };
        log::trace!("rx {}", dllp);
        match dllp {
            Dllp::Ack(seq) => {
                self.stats.acks_received += 1;
                self.acknowledge(seq);
            }
            Dllp::Nak(seq) => {
                self.stats.naks_received += 1;
                self.acknowledge(seq);
                self.start_replay();
            }
        }
    }

    /// Purge the retry buffer up to and including `seq`.
    fn acknowledge(&mut self, seq: u16) {
        let progress = seq_distance(self.acked_seq, seq) as usize;
        if progress == 0 {
            return;
        }
        if progress > self.retry_buffer.len() {
            log::debug!(
                "ignoring acknowledgement of {} (last acked {}, {} in flight)",
                seq,
                self.acked_seq,
                self.retry_buffer.len()
            );
            return;
        }
        self.retry_buffer.drain(..progress);
        self.acked_seq = seq;
        self.replay_count = 0;
        self.replay_timer = 0;
        self.replay_cursor = self
            .replay_cursor
            .map(|cursor| cursor.saturating_sub(progress))
            .filter(|cursor| *cursor < self.retry_buffer.len());
    }

    fn start_replay(&mut self) {
        if self.retry_buffer.is_empty() {
            return;
        }
        self.stats.replays += 1;
        self.replay_count += 1;
        if self.replay_count > self.config.replay_limit {
            log::warn!(
                "replay limit of {} exceeded at sequence {}, retraining",
                self.config.replay_limit,
                seq_add(self.acked_seq, 1)
            );
            self.replay_count = 0;
            self.retrain_requested = true;
            self.stats.retrain_requests += 1;
        }
        self.replay_cursor = Some(0);
        self.replay_timer = 0;
    }

    /// Advance the replay timer by one cycle. Only runs while the link can
    /// carry traffic.
    pub fn tick(&mut self) {
        if self.retry_buffer.is_empty() || self.replay_cursor.is_some() {
            return;
        }
        self.replay_timer += 1;
        if self.replay_timer >= self.config.replay_timeout {
            log::debug!("replay timer expired with {} frames in flight", self.retry_buffer.len());
            self.stats.replay_timeouts += 1;
            self.start_replay();
        }
    }

    fn dllp(&self, dllp: Dllp) -> Frame {
        log::trace!("tx {}", dllp);
        Frame::new(FrameKind::DataLink, dllp.encode(&self.dllp_crc))
    }

    fn ack(&mut self) -> Frame {
        self.send_ack = false;
        self.unacked = 0;
        self.stats.acks_sent += 1;
        self.dllp(Dllp::Ack(seq_add(self.expected_seq, SEQUENCE_MODULUS - 1)))
    }

    fn replay_next(&mut self) -> Option<Frame> {
        let cursor = self.replay_cursor?;
        let entry = self.retry_buffer.get(cursor)?;
        let frame = Frame::new(FrameKind::Transaction, entry.bytes.clone());
        log::trace!("replaying frame {}", entry.seq);
        self.replay_cursor = Some(cursor + 1).filter(|next| *next < self.retry_buffer.len());
        self.stats.tlps_replayed += 1;
        Some(frame)
    }

    fn transmit_new(&mut self) -> Option<Frame> {
        if self.retry_buffer.len() >= self.config.retry_buffer_capacity {
            return None;
        }
        let tlp = self.pending.pop_front()?;
        let seq = self.next_seq;
        let mut bytes = Vec::with_capacity(SEQUENCE_LEN + tlp.len() + self.lcrc.byte_len());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&tlp);
        let checksum = self.lcrc.compute(&bytes).to_be_bytes();
        bytes.extend_from_slice(&checksum[4 - self.lcrc.byte_len()..]);
        if self.retry_buffer.is_empty() {
            self.replay_timer = 0;
        }
        self.retry_buffer.push_back(RetryEntry {
            seq,
            bytes: bytes.clone(),
        });
        self.next_seq = seq_add(seq, 1);
        self.stats.tlps_sent += 1;
        Some(Frame::new(FrameKind::Transaction, bytes))
    }

    /// The next frame to transmit: Nak, then a due Ack, then replays, then
    /// new frames, then any deferred Ack.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.send_nak {
            self.send_nak = false;
            self.send_ack = false;
            self.unacked = 0;
            self.stats.naks_sent += 1;
            let nak = Dllp::Nak(seq_add(self.expected_seq, SEQUENCE_MODULUS - 1));
            return Some(self.dllp(nak));
        }
        if self.send_ack || self.unacked >= self.config.ack_coalesce {
            return Some(self.ack());
        }
        if let Some(frame) = self.replay_next() {
            return Some(frame);
        }
        if let Some(frame) = self.transmit_new() {
            return Some(frame);
        }
        if self.unacked > 0 {
            return Some(self.ack());
        }
        None
    }
}
