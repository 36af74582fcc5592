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

//! The memory-transaction subset of the transaction layer.
//!
//! Packets use the PCIe header layout for `fmt`/`type` and identifiers,
//! with one simplification: the length field counts bytes rather than
//! doublewords, so no byte enables are needed.
//!
//! ```text
//! request:    | fmt type | 0 | length[15:0] | requester | tag | 0 | address (4 or 8) | data
//! completion: | fmt type | 0 | length[15:0] | completer | status:3 count:13 |
//!             | requester | tag | lower address | data
//! ```

use crate::error::Error;
use crate::memory::{MemoryModel, MemoryStatus};
use crate::Cycle;
use std::collections::BTreeMap;
use std::fmt;

/// Largest read or write a single request may carry.
pub const MAX_PAYLOAD: usize = 4096;

const FMT_3DW: u8 = 0b000;
const FMT_4DW: u8 = 0b001;
const FMT_3DW_DATA: u8 = 0b010;
const FMT_4DW_DATA: u8 = 0b011;
const TYPE_MEMORY: u8 = 0b0_0000;
const TYPE_COMPLETION: u8 = 0b0_1010;

const REQUEST_HEADER_LEN: usize = 8;
const COMPLETION_HEADER_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    Read,
    Write,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub requester: u16,
    pub tag: u8,
    pub address: u64,
    /// Bytes to read; for writes always `data.len()`.
    pub length: u32,
    pub data: Vec<u8>,
}

impl Request {
    pub fn read(requester: u16, tag: u8, address: u64, length: u32) -> Self {
        Self {
            kind: RequestKind::Read,
            requester,
            tag,
            address,
            length,
            data: Vec::new(),
        }
    }

    pub fn write(requester: u16, tag: u8, address: u64, data: Vec<u8>) -> Self {
        Self {
            kind: RequestKind::Write,
            requester,
            tag,
            address,
            length: data.len() as u32,
            data,
        }
    }

    fn is_64bit(&self) -> bool {
        self.address > u32::MAX as u64
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionStatus {
    Successful,
    UnsupportedRequest,
    CompleterAbort,
}

impl CompletionStatus {
    fn code(self) -> u16 {
        match self {
            CompletionStatus::Successful => 0b000,
            CompletionStatus::UnsupportedRequest => 0b001,
            CompletionStatus::CompleterAbort => 0b100,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0b000 => Some(CompletionStatus::Successful),
            0b001 => Some(CompletionStatus::UnsupportedRequest),
            0b100 => Some(CompletionStatus::CompleterAbort),
            _ => None,
        }
    }
}

impl From<MemoryStatus> for CompletionStatus {
    fn from(status: MemoryStatus) -> Self {
        match status {
            MemoryStatus::Ok => CompletionStatus::Successful,
            MemoryStatus::OutOfRange => CompletionStatus::UnsupportedRequest,
            MemoryStatus::Misaligned => CompletionStatus::CompleterAbort,
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Successful => f.write_str("SC"),
            CompletionStatus::UnsupportedRequest => f.write_str("UR"),
            CompletionStatus::CompleterAbort => f.write_str("CA"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub completer: u16,
    pub requester: u16,
    pub tag: u8,
    pub status: CompletionStatus,
    pub byte_count: u16,
    pub lower_address: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransactionPacket {
    Request(Request),
    Completion(Completion),
}

/// Reasons a transaction packet that passed the link CRC is still dropped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MalformedPacket {
    Truncated,
    UnsupportedType(u8),
    LengthMismatch,
    InvalidStatus(u16),
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

impl TransactionPacket {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TransactionPacket::Request(request) => {
                let fmt = match (request.kind, request.is_64bit()) {
                    (RequestKind::Read, false) => FMT_3DW,
                    (RequestKind::Read, true) => FMT_4DW,
                    (RequestKind::Write, false) => FMT_3DW_DATA,
                    (RequestKind::Write, true) => FMT_4DW_DATA,
                };
                let mut bytes = Vec::with_capacity(REQUEST_HEADER_LEN + 8 + request.data.len());
                bytes.push(fmt << 5 | TYPE_MEMORY);
                bytes.push(0);
                bytes.extend_from_slice(&(request.length as u16).to_be_bytes());
                bytes.extend_from_slice(&request.requester.to_be_bytes());
                bytes.push(request.tag);
                bytes.push(0);
                if request.is_64bit() {
                    bytes.extend_from_slice(&request.address.to_be_bytes());
                } else {
                    bytes.extend_from_slice(&(request.address as u32).to_be_bytes());
                }
                bytes.extend_from_slice(&request.data);
                bytes
            }
            TransactionPacket::Completion(completion) => {
                let fmt = if completion.data.is_empty() {
                    FMT_3DW
                } else {
                    FMT_3DW_DATA
                };
                let mut bytes = Vec::with_capacity(COMPLETION_HEADER_LEN + completion.data.len());
                bytes.push(fmt << 5 | TYPE_COMPLETION);
                bytes.push(0);
                bytes.extend_from_slice(&(completion.data.len() as u16).to_be_bytes());
                bytes.extend_from_slice(&completion.completer.to_be_bytes());
                let status = completion.status.code() << 13 | (completion.byte_count & 0x1fff);
                bytes.extend_from_slice(&status.to_be_bytes());
                bytes.extend_from_slice(&completion.requester.to_be_bytes());
                bytes.push(completion.tag);
                bytes.push(completion.lower_address);
                bytes.extend_from_slice(&completion.data);
                bytes
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<TransactionPacket, MalformedPacket> {
        if bytes.len() < REQUEST_HEADER_LEN {
            return Err(MalformedPacket::Truncated);
        }
        let fmt = bytes[0] >> 5;
        let kind = bytes[0] & 0x1f;
        let length = u16_at(bytes, 2) as usize;
        match (fmt, kind) {
            (FMT_3DW..=FMT_4DW_DATA, TYPE_MEMORY) => {
                let address_len = if fmt & 1 == 1 { 8 } else { 4 };
                let header_len = REQUEST_HEADER_LEN + address_len;
                if bytes.len() < header_len {
                    return Err(MalformedPacket::Truncated);
                }
                let address = bytes[REQUEST_HEADER_LEN..header_len]
                    .iter()
                    .fold(0u64, |address, byte| address << 8 | *byte as u64);
                let has_data = fmt & 0b010 != 0;
                let payload = &bytes[header_len..];
                if (has_data && payload.len() != length) || (!has_data && !payload.is_empty()) {
                    return Err(MalformedPacket::LengthMismatch);
                }
                Ok(TransactionPacket::Request(Request {
                    kind: if has_data {
                        RequestKind::Write
                    } else {
                        RequestKind::Read
                    },
                    requester: u16_at(bytes, 4),
                    tag: bytes[6],
                    address,
                    length: length as u32,
                    data: payload.to_vec(),
                }))
            }
            (FMT_3DW, TYPE_COMPLETION) | (FMT_3DW_DATA, TYPE_COMPLETION) => {
                if bytes.len() < COMPLETION_HEADER_LEN {
                    return Err(MalformedPacket::Truncated);
                }
                let payload = &bytes[COMPLETION_HEADER_LEN..];
                if payload.len() != length || (fmt == FMT_3DW) != payload.is_empty() {
                    return Err(MalformedPacket::LengthMismatch);
                }
                let status_field = u16_at(bytes, 6);
                let status = CompletionStatus::from_code(status_field >> 13)
                    .ok_or(MalformedPacket::InvalidStatus(status_field >> 13))?;
                Ok(TransactionPacket::Completion(Completion {
                    completer: u16_at(bytes, 4),
                    requester: u16_at(bytes, 8),
                    tag: bytes[10],
                    status,
                    byte_count: status_field & 0x1fff,
                    lower_address: bytes[11],
                    data: payload.to_vec(),
                }))
            }
            _ => Err(MalformedPacket::UnsupportedType(bytes[0])),
        }
    }
}

impl fmt::Display for TransactionPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPacket::Request(request) => write!(
                f,
                "{}{} @{:#x} len {} tag {} from {:#06x}",
                match request.kind {
                    RequestKind::Read => "MRd",
                    RequestKind::Write => "MWr",
                },
                if request.is_64bit() { 64 } else { 32 },
                request.address,
                request.length,
                request.tag,
                request.requester
            ),
            TransactionPacket::Completion(completion) => write!(
                f,
                "{} {} tag {} to {:#06x} count {}",
                if completion.data.is_empty() {
                    "Cpl"
                } else {
                    "CplD"
                },
                completion.status,
                completion.tag,
                completion.requester,
                completion.byte_count
            ),
        }
    }
}

/// Service `request` against `memory`; every request gets a completion.
pub fn complete_request(memory: &mut MemoryModel, request: &Request, completer: u16) -> Completion {
    // a completion that large would not fit in a frame
    if request.length as usize > MAX_PAYLOAD {
        log::warn!(
            "unsupported {} byte request @{:#x} from {:#06x}",
            request.length,
            request.address,
            request.requester
        );
        return Completion {
            completer,
            requester: request.requester,
            tag: request.tag,
            status: CompletionStatus::UnsupportedRequest,
            byte_count: 0,
            lower_address: (request.address & 0x7f) as u8,
            data: Vec::new(),
        };
    }
    let (status, data) = match request.kind {
        RequestKind::Read => {
            let (data, status) = memory.read(request.address, request.length as u64);
            (status, data)
        }
        RequestKind::Write => (memory.write(request.address, &request.data), Vec::new()),
    };
    Completion {
        completer,
        requester: request.requester,
        tag: request.tag,
        status: status.into(),
        byte_count: request.length as u16,
        lower_address: (request.address & 0x7f) as u8,
        data,
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestResult {
    Completed {
        status: CompletionStatus,
        data: Vec<u8>,
    },
    TimedOut,
}

/// The final state of a request issued through a [`Requester`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestOutcome {
    pub tag: u8,
    pub kind: RequestKind,
    pub address: u64,
    pub result: RequestResult,
}

#[derive(Clone, Debug)]
struct Outstanding {
    kind: RequestKind,
    address: u64,
    length: u32,
    issued: Cycle,
}

/// Tag allocation and completion matching for locally issued requests.
#[derive(Clone, Debug)]
pub struct Requester {
    id: u16,
    completion_timeout: Cycle,
    next_tag: u8,
    outstanding: BTreeMap<u8, Outstanding>,
}

impl Requester {
    pub fn new(id: u16, completion_timeout: Cycle) -> Self {
        Self {
            id,
            completion_timeout,
            next_tag: 0,
            outstanding: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn allocate_tag(&mut self) -> Result<u8, Error> {
        let tag = (0..=u8::MAX)
            .map(|offset| self.next_tag.wrapping_add(offset))
            .find(|tag| !self.outstanding.contains_key(tag))
            .ok_or(Error::TagsExhausted)?;
        self.next_tag = tag.wrapping_add(1);
        Ok(tag)
    }

    fn issue(&mut self, request: &Request, cycle: Cycle) {
        self.outstanding.insert(
            request.tag,
            Outstanding {
                kind: request.kind,
                address: request.address,
                length: request.length,
                issued: cycle,
            },
        );
    }

    pub fn read(&mut self, address: u64, length: u32, cycle: Cycle) -> Result<Request, Error> {
        if length as usize > MAX_PAYLOAD {
            return Err(Error::InvalidRequest(format!(
                "read of {} bytes exceeds {}",
                length, MAX_PAYLOAD
            )));
        }
        let request = Request::read(self.id, self.allocate_tag()?, address, length);
        self.issue(&request, cycle);
        Ok(request)
    }

    pub fn write(&mut self, address: u64, data: Vec<u8>, cycle: Cycle) -> Result<Request, Error> {
        if data.is_empty() || data.len() > MAX_PAYLOAD {
            return Err(Error::InvalidRequest(format!(
                "write of {} bytes not in 1..={}",
                data.len(),
                MAX_PAYLOAD
            )));
        }
        let request = Request::write(self.id, self.allocate_tag()?, address, data);
        self.issue(&request, cycle);
        Ok(request)
    }

    /// Match a received completion; unexpected completions are dropped.
    pub fn complete(&mut self, completion: Completion) -> Option<RequestOutcome> {
        if completion.requester != self.id {
            log::warn!(
                "dropping completion for requester {:#06x} (tag {})",
                completion.requester,
                completion.tag
            );
            return None;
        }
        let outstanding = match self.outstanding.remove(&completion.tag) {
            Some(outstanding) => outstanding,
            None => {
                log::warn!("dropping unexpected completion for tag {}", completion.tag);
                return None;
            }
        };
        if completion.status == CompletionStatus::Successful
            && outstanding.kind == RequestKind::Read
            && completion.data.len() != outstanding.length as usize
        {
            log::warn!(
                "completion for tag {} carries {} of {} bytes",
                completion.tag,
                completion.data.len(),
                outstanding.length
            );
        }
        Some(RequestOutcome {
            tag: completion.tag,
            kind: outstanding.kind,
            address: outstanding.address,
            result: RequestResult::Completed {
                status: completion.status,
                data: completion.data,
            },
        })
    }

    /// Retire every request that has waited longer than the completion
    /// timeout.
    pub fn expire(&mut self, cycle: Cycle) -> Vec<RequestOutcome> {
        let timeout = self.completion_timeout;
        let expired = self
            .outstanding
            .iter()
            .filter(|(_, o)| cycle.saturating_sub(o.issued) >= timeout)
            .map(|(tag, _)| *tag)
            .collect::<Vec<_>>();
        expired
            .into_iter()
            .filter_map(|tag| self.outstanding.remove(&tag).map(|o| (tag, o)))
            .map(|(tag, outstanding)| {
                log::warn!(
                    "completion timeout for tag {} @{:#x}",
                    tag,
                    outstanding.address
                );
                RequestOutcome {
                    tag,
                    kind: outstanding.kind,
                    address: outstanding.address,
                    result: RequestResult::TimedOut,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionDescriptor;

    #[test]
    fn test_packet_layout() {
        let read = TransactionPacket::Request(Request::read(0x0100, 7, 0x2000, 4));
        assert_eq!(
            read.encode(),
            vec![0x00, 0, 0, 4, 0x01, 0x00, 7, 0, 0, 0, 0x20, 0x00]
        );
        let write = TransactionPacket::Request(Request::write(0x0100, 1, 0x1_0000_0000, vec![0xaa]));
        let bytes = write.encode();
        assert_eq!(bytes[0], 0x60);
        assert_eq!(bytes.len(), REQUEST_HEADER_LEN + 8 + 1);
        assert_eq!(TransactionPacket::decode(&bytes), Ok(write));
        assert_eq!(TransactionPacket::decode(&read.encode()), Ok(read));
    }

    #[test]
    fn test_completion_layout() {
        let completion = TransactionPacket::Completion(Completion {
            completer: 0x0200,
            requester: 0x0100,
            tag: 9,
            status: CompletionStatus::UnsupportedRequest,
            byte_count: 4,
            lower_address: 0,
            data: vec![],
        });
        let bytes = completion.encode();
        assert_eq!(bytes[0], 0x0a);
        assert_eq!(u16_at(&bytes, 6), 0x2004);
        assert_eq!(TransactionPacket::decode(&bytes), Ok(completion));
    }

    #[test]
    fn test_malformed_packets() {
        assert_eq!(
            TransactionPacket::decode(&[0; 3]),
            Err(MalformedPacket::Truncated)
        );
        let mut bytes = TransactionPacket::Request(Request::write(1, 1, 0x10, vec![1, 2])).encode();
        bytes.push(3);
        assert_eq!(
            TransactionPacket::decode(&bytes),
            Err(MalformedPacket::LengthMismatch)
        );
        bytes[0] = 0x04 << 5 | 0x1f;
        assert_eq!(
            TransactionPacket::decode(&bytes),
            Err(MalformedPacket::UnsupportedType(0x9f))
        );
    }

    #[test]
    fn test_completer_status_mapping() {
        let mut memory = MemoryModel::new(&[RegionDescriptor::new(0x0, 0x1000, 4)]).unwrap();
        let write = complete_request(&mut memory, &Request::write(1, 2, 0x10, vec![1, 2, 3, 4]), 9);
        assert_eq!(write.status, CompletionStatus::Successful);
        assert!(write.data.is_empty());
        assert_eq!(write.tag, 2);

        let read = complete_request(&mut memory, &Request::read(1, 3, 0x10, 4), 9);
        assert_eq!(read.status, CompletionStatus::Successful);
        assert_eq!(read.data, vec![1, 2, 3, 4]);
        assert_eq!(read.byte_count, 4);
        assert_eq!(read.lower_address, 0x10);

        let out_of_range = complete_request(&mut memory, &Request::read(1, 4, 0x2000, 4), 9);
        assert_eq!(out_of_range.status, CompletionStatus::UnsupportedRequest);
        assert!(out_of_range.data.is_empty());

        let misaligned = complete_request(&mut memory, &Request::write(1, 5, 0x11, vec![0; 4]), 9);
        assert_eq!(misaligned.status, CompletionStatus::CompleterAbort);
        assert_eq!(memory.read(0x10, 8).0, vec![1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn test_oversized_requests_are_unsupported() {
        let mut memory = MemoryModel::new(&[RegionDescriptor::new(0x0, 0x4000, 1)]).unwrap();
        let read = complete_request(&mut memory, &Request::read(1, 6, 0x0, 8192), 9);
        assert_eq!(read.status, CompletionStatus::UnsupportedRequest);
        assert!(read.data.is_empty());
        assert_eq!(read.tag, 6);
        assert!(TransactionPacket::Completion(read).encode().len() < MAX_PAYLOAD);

        let write = complete_request(
            &mut memory,
            &Request::write(1, 7, 0x0, vec![0xff; MAX_PAYLOAD + 4]),
            9,
        );
        assert_eq!(write.status, CompletionStatus::UnsupportedRequest);
        assert_eq!(memory.read(0x0, 4).0, vec![0; 4]);

        // the largest legal read is still served
        let read = complete_request(&mut memory, &Request::read(1, 8, 0x0, MAX_PAYLOAD as u32), 9);
        assert_eq!(read.status, CompletionStatus::Successful);
        assert_eq!(read.data.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_requester_tags_and_timeouts() {
        let mut requester = Requester::new(0x0100, 50);
        let first = requester.read(0x0, 4, 0).unwrap();
        let second = requester.write(0x4, vec![1; 4], 10).unwrap();
        assert_ne!(first.tag, second.tag);
        assert_eq!(requester.outstanding(), 2);
        assert!(requester.write(0x4, vec![], 10).is_err());
        assert!(requester.read(0x4, MAX_PAYLOAD as u32 + 1, 10).is_err());

        let mut memory = MemoryModel::new(&[RegionDescriptor::new(0x0, 0x1000, 1)]).unwrap();
        let completion = complete_request(&mut memory, &first, 0x0200);
        let outcome = requester.complete(completion.clone()).unwrap();
        assert_eq!(outcome.tag, first.tag);
        assert_eq!(
            outcome.result,
            RequestResult::Completed {
                status: CompletionStatus::Successful,
                data: vec![0; 4]
            }
        );
        // a second completion for the same tag is unexpected
        assert_eq!(requester.complete(completion), None);

        assert!(requester.expire(59).is_empty());
        let expired = requester.expire(60);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tag, second.tag);
        assert_eq!(expired[0].result, RequestResult::TimedOut);
        assert_eq!(requester.outstanding(), 0);
    }

    #[test]
    fn test_tags_exhausted() {
        let mut requester = Requester::new(1, 1000);
        for _ in 0..256 {
            requester.read(0, 1, 0).unwrap();
        }
        assert_eq!(requester.read(0, 1, 0).unwrap_err(), Error::TagsExhausted);
    }
}
