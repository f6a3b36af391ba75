// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Copy-engine command batches.
//!
//! A batch is a stream of 32-bit dwords. Every command starts with a header
//! dword followed by its payload.
//!
//! ## Command header (32 bits)
//!
//! | Bits    | Field                      |
//! |---------|----------------------------|
//! | 23:0    | Payload length in dwords   |
//! | 31:24   | Opcode                     |
//!
//! 64-bit operands are stored low dword first.

use thiserror::Error;

use gpuvm_common::GpuVa;

/// Maximum qwords carried by one store command.
pub const MAX_STORE_QWORDS: usize = 0xFF;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    End = 0x0A,
    StoreQwords = 0x20,
    FlushTlb = 0x26,
    Copy = 0x40,
    Fill = 0x41,
}

impl Opcode {
    fn from_raw(v: u32) -> Option<Self> {
        match v {
            0x0A => Some(Self::End),
            0x20 => Some(Self::StoreQwords),
            0x26 => Some(Self::FlushTlb),
            0x40 => Some(Self::Copy),
            0x41 => Some(Self::Fill),
            _ => None,
        }
    }
}

/// A parsed command header.
#[derive(Debug, Clone, Copy)]
pub struct Header(u32);

impl Header {
    pub fn new(opcode: Opcode, len: u32) -> Self {
        Self(((opcode as u32) << 24) | (len & 0xFF_FFFF))
    }

    pub fn raw_opcode(&self) -> u32 {
        self.0 >> 24
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.raw_opcode())
    }

    /// Payload length in dwords (bits [23:0]).
    pub fn length(&self) -> usize {
        (self.0 & 0xFF_FFFF) as usize
    }
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store qwords at consecutive GPU virtual addresses.
    StoreQwords { va: GpuVa, data: Vec<u64> },
    /// Copy `len` bytes between GPU virtual addresses.
    Copy { src: GpuVa, dst: GpuVa, len: u64 },
    /// Fill `len` bytes at `dst` with `value`.
    Fill { dst: GpuVa, len: u64, value: u8 },
    /// Invalidate the engine's translation cache.
    FlushTlb,
    End,
}

/// Errors from batch decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{opcode:02X} at dword {at}")]
    UnknownOpcode { opcode: u32, at: usize },

    #[error("command at dword {at} runs past the end of the batch")]
    Truncated { at: usize },

    #[error("malformed payload for {opcode:?} at dword {at}")]
    Malformed { opcode: Opcode, at: usize },

    #[error("batch has no end command")]
    MissingEnd,
}

fn lo(v: u64) -> u32 {
    v as u32
}

fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

fn join(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

/// An encoded command batch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    dwords: Vec<u32>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, opcode: Opcode, payload: &[u32]) {
        self.dwords.push(Header::new(opcode, payload.len() as u32).0);
        self.dwords.extend_from_slice(payload);
    }

    /// Emit stores of `data` starting at `va`, split into commands of at most
    /// [`MAX_STORE_QWORDS`] qwords.
    pub fn store_qwords(&mut self, va: GpuVa, data: &[u64]) -> &mut Self {
        for (i, chunk) in data.chunks(MAX_STORE_QWORDS).enumerate() {
            let at = va + (i * MAX_STORE_QWORDS * 8) as u64;
            let mut payload = Vec::with_capacity(2 + chunk.len() * 2);
            payload.extend_from_slice(&[lo(at), hi(at)]);
            for &q in chunk {
                payload.extend_from_slice(&[lo(q), hi(q)]);
            }
            self.push(Opcode::StoreQwords, &payload);
        }
        self
    }

    pub fn copy(&mut self, src: GpuVa, dst: GpuVa, len: u64) -> &mut Self {
        self.push(
            Opcode::Copy,
            &[lo(src), hi(src), lo(dst), hi(dst), lo(len), hi(len)],
        );
        self
    }

    pub fn fill(&mut self, dst: GpuVa, len: u64, value: u8) -> &mut Self {
        self.push(Opcode::Fill, &[lo(dst), hi(dst), lo(len), hi(len), value as u32]);
        self
    }

    pub fn flush_tlb(&mut self) -> &mut Self {
        self.push(Opcode::FlushTlb, &[]);
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.push(Opcode::End, &[]);
        self
    }

    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    /// Decode the batch up to and including its end command.
    pub fn decode(&self) -> Result<Vec<Command>, DecodeError> {
        let mut commands = Vec::new();
        let mut pos = 0usize;
        while pos < self.dwords.len() {
            let header = Header(self.dwords[pos]);
            let opcode = header.opcode().ok_or(DecodeError::UnknownOpcode {
                opcode: header.raw_opcode(),
                at: pos,
            })?;
            let start = pos + 1;
            let end = start + header.length();
            if end > self.dwords.len() {
                return Err(DecodeError::Truncated { at: pos });
            }
            let p = &self.dwords[start..end];
            let malformed = DecodeError::Malformed { opcode, at: pos };

            let command = match opcode {
                Opcode::StoreQwords => {
                    if p.len() < 2 || p.len() % 2 != 0 {
                        return Err(malformed);
                    }
                    Command::StoreQwords {
                        va: join(p[0], p[1]),
                        data: p[2..].chunks(2).map(|c| join(c[0], c[1])).collect(),
                    }
                }
                Opcode::Copy => {
                    if p.len() != 6 {
                        return Err(malformed);
                    }
                    Command::Copy {
                        src: join(p[0], p[1]),
                        dst: join(p[2], p[3]),
                        len: join(p[4], p[5]),
                    }
                }
                Opcode::Fill => {
                    if p.len() != 5 {
                        return Err(malformed);
                    }
                    Command::Fill {
                        dst: join(p[0], p[1]),
                        len: join(p[2], p[3]),
                        value: p[4] as u8,
                    }
                }
                Opcode::FlushTlb => Command::FlushTlb,
                Opcode::End => {
                    commands.push(Command::End);
                    return Ok(commands);
                }
            };
            commands.push(command);
            pos = end;
        }
        Err(DecodeError::MissingEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let h = Header::new(Opcode::Copy, 6);
        assert_eq!(h.opcode(), Some(Opcode::Copy));
        assert_eq!(h.length(), 6);
        assert_eq!(Header(0xFF00_0000).opcode(), None);
    }

    #[test]
    fn test_decode_mixed_batch() {
        let mut batch = Batch::new();
        batch
            .store_qwords(0x4000_0008, &[0x1_0000_1003, u64::MAX])
            .flush_tlb()
            .copy(0x1000, 0x8000_0000_0000, 0x2_0000_0000)
            .fill(0x2000, 64, 0xAB)
            .end();

        let cmds = batch.decode().unwrap();
        assert_eq!(cmds.len(), 5);
        assert_eq!(
            cmds[0],
            Command::StoreQwords {
                va: 0x4000_0008,
                data: vec![0x1_0000_1003, u64::MAX]
            }
        );
        assert_eq!(
            cmds[2],
            Command::Copy {
                src: 0x1000,
                dst: 0x8000_0000_0000,
                len: 0x2_0000_0000
            }
        );
        assert_eq!(cmds[4], Command::End);
    }

    #[test]
    fn test_store_splits_large_payload() {
        let data: Vec<u64> = (0..(MAX_STORE_QWORDS as u64 + 10)).collect();
        let mut batch = Batch::new();
        batch.store_qwords(0x1000, &data).end();
        let cmds = batch.decode().unwrap();
        assert_eq!(cmds.len(), 3);
        match &cmds[1] {
            Command::StoreQwords { va, data } => {
                assert_eq!(*va, 0x1000 + (MAX_STORE_QWORDS * 8) as u64);
                assert_eq!(data.len(), 10);
                assert_eq!(data[0], MAX_STORE_QWORDS as u64);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        let mut batch = Batch::new();
        batch.flush_tlb();
        assert_eq!(batch.decode(), Err(DecodeError::MissingEnd));

        let bogus = Batch {
            dwords: vec![0x7700_0000],
        };
        assert!(matches!(
            bogus.decode(),
            Err(DecodeError::UnknownOpcode { opcode: 0x77, at: 0 })
        ));

        let truncated = Batch {
            dwords: vec![Header::new(Opcode::Copy, 6).0, 1, 2],
        };
        assert_eq!(truncated.decode(), Err(DecodeError::Truncated { at: 0 }));
    }
}
