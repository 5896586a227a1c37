// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! LZMA and LZMA2 decompression.
//!
//! A textbook range-coder decoder: 12-state machine, literal/match/rep
//! packets, pos-slot + reversed bit trees for distances and a three-tier
//! length coder. Failure is local - a malformed stream stops decoding and
//! the caller gets whatever was produced up to that point.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::{ParseError, Result};

const NUM_STATES: usize = 12;
const NUM_POS_BITS_MAX: usize = 4;
const NUM_LEN_TO_POS_STATES: usize = 4;
const NUM_ALIGN_BITS: u32 = 4;
const END_POS_MODEL_INDEX: u32 = 14;
const NUM_FULL_DISTANCES: u32 = 1 << (END_POS_MODEL_INDEX >> 1);
const MATCH_MIN_LEN: usize = 2;

const PROB_INIT: u16 = 1024; // half of the 2048 total
const TOP_VALUE: u32 = 1 << 24;

/// Minimum output window regardless of the advertised dictionary
pub const MIN_DICT_SIZE: u32 = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaProps {
    pub lc: u32,
    pub lp: u32,
    pub pb: u32,
    pub dict_size: u32,
}

impl LzmaProps {
    /// Decode the classic 5-byte header: packed (lc, lp, pb) then the
    /// little-endian dictionary size.
    pub fn parse(header: &[u8]) -> Result<Self> {
        if header.len() < 5 {
            return Err(ParseError::Truncated);
        }
        let mut d = header[0] as u32;
        if d >= 9 * 5 * 5 {
            return Err(ParseError::UnsupportedLayout);
        }
        let lc = d % 9;
        d /= 9;
        let lp = d % 5;
        let pb = d / 5;
        let dict_size = u32::max(LittleEndian::read_u32(&header[1..5]), MIN_DICT_SIZE);
        Ok(Self {
            lc,
            lp,
            pb,
            dict_size,
        })
    }

    /// LZMA2 packs only (lc, lp, pb) into one byte; the dictionary size
    /// comes from the container.
    fn from_lzma2_byte(b: u8, dict_size: u32) -> Result<Self> {
        let mut d = b as u32;
        if d >= 9 * 5 * 5 {
            return Err(ParseError::UnsupportedLayout);
        }
        let lc = d % 9;
        d /= 9;
        let lp = d % 5;
        let pb = d / 5;
        Ok(Self {
            lc,
            lp,
            pb,
            dict_size: u32::max(dict_size, MIN_DICT_SIZE),
        })
    }
}

struct RangeDecoder<'a> {
    src: &'a [u8],
    pos: usize,
    range: u32,
    code: u32,
    truncated: bool,
}

impl<'a> RangeDecoder<'a> {
    fn new(src: &'a [u8]) -> Result<Self> {
        if src.len() < 5 {
            return Err(ParseError::Truncated);
        }
        let mut rc = Self {
            src,
            pos: 5,
            range: 0xFFFF_FFFF,
            code: BigEndian::read_u32(&src[1..5]),
            truncated: false,
        };
        // The first byte of a well-formed stream is zero
        if src[0] != 0 {
            rc.truncated = true;
        }
        Ok(rc)
    }

    fn next_byte(&mut self) -> u32 {
        match self.src.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                b as u32
            }
            None => {
                self.truncated = true;
                0
            }
        }
    }

    fn normalize(&mut self) {
        if self.range < TOP_VALUE {
            self.range <<= 8;
            self.code = (self.code << 8) | self.next_byte();
        }
    }

    fn decode_bit(&mut self, prob: &mut u16) -> u32 {
        let bound = (self.range >> 11) * *prob as u32;
        let bit;
        if self.code < bound {
            *prob += (2048 - *prob) >> 5;
            self.range = bound;
            bit = 0;
        } else {
            *prob -= *prob >> 5;
            self.code -= bound;
            self.range -= bound;
            bit = 1;
        }
        self.normalize();
        bit
    }

    fn decode_direct_bits(&mut self, count: u32) -> u32 {
        let mut res = 0u32;
        for _ in 0..count {
            self.range >>= 1;
            self.code = self.code.wrapping_sub(self.range);
            let t = 0u32.wrapping_sub(self.code >> 31);
            self.code = self.code.wrapping_add(self.range & t);
            self.normalize();
            res = (res << 1).wrapping_add(t.wrapping_add(1));
        }
        res
    }

    fn bit_tree_decode(&mut self, probs: &mut [u16], num_bits: u32) -> u32 {
        let mut m = 1usize;
        for _ in 0..num_bits {
            m = (m << 1) + self.decode_bit(&mut probs[m]) as usize;
        }
        m as u32 - (1 << num_bits)
    }

    fn bit_tree_reverse_decode(&mut self, probs: &mut [u16], base: usize, num_bits: u32) -> u32 {
        let mut m = 1usize;
        let mut sym = 0u32;
        for i in 0..num_bits {
            let bit = self.decode_bit(&mut probs[base + m]);
            m = (m << 1) + bit as usize;
            sym |= bit << i;
        }
        sym
    }
}

struct LenDecoder {
    choice: u16,
    choice2: u16,
    low: [[u16; 8]; 1 << NUM_POS_BITS_MAX],
    mid: [[u16; 8]; 1 << NUM_POS_BITS_MAX],
    high: [u16; 256],
}

impl LenDecoder {
    fn new() -> Self {
        Self {
            choice: PROB_INIT,
            choice2: PROB_INIT,
            low: [[PROB_INIT; 8]; 1 << NUM_POS_BITS_MAX],
            mid: [[PROB_INIT; 8]; 1 << NUM_POS_BITS_MAX],
            high: [PROB_INIT; 256],
        }
    }

    /// Returns the full match length (minimum 2).
    fn decode(&mut self, rc: &mut RangeDecoder, pos_state: usize) -> usize {
        let v = if rc.decode_bit(&mut self.choice) == 0 {
            rc.bit_tree_decode(&mut self.low[pos_state], 3)
        } else if rc.decode_bit(&mut self.choice2) == 0 {
            8 + rc.bit_tree_decode(&mut self.mid[pos_state], 3)
        } else {
            16 + rc.bit_tree_decode(&mut self.high, 8)
        };
        MATCH_MIN_LEN + v as usize
    }
}

enum DecodeOutcome {
    EndMarker,
    LimitReached,
    InputExhausted,
}

struct LzmaDecoder {
    props: LzmaProps,
    lit_probs: Vec<u16>,
    is_match: [[u16; 1 << NUM_POS_BITS_MAX]; NUM_STATES],
    is_rep: [u16; NUM_STATES],
    is_rep_g0: [u16; NUM_STATES],
    is_rep_g1: [u16; NUM_STATES],
    is_rep_g2: [u16; NUM_STATES],
    is_rep0_long: [[u16; 1 << NUM_POS_BITS_MAX]; NUM_STATES],
    pos_slot: [[u16; 64]; NUM_LEN_TO_POS_STATES],
    spec_pos: [u16; (1 + NUM_FULL_DISTANCES - END_POS_MODEL_INDEX) as usize],
    align: [u16; 16],
    len_dec: LenDecoder,
    rep_len_dec: LenDecoder,
    state: usize,
    reps: [u32; 4],
}

impl LzmaDecoder {
    fn new(props: LzmaProps) -> Self {
        Self {
            props,
            lit_probs: vec![PROB_INIT; 0x300 << (props.lc + props.lp)],
            is_match: [[PROB_INIT; 1 << NUM_POS_BITS_MAX]; NUM_STATES],
            is_rep: [PROB_INIT; NUM_STATES],
            is_rep_g0: [PROB_INIT; NUM_STATES],
            is_rep_g1: [PROB_INIT; NUM_STATES],
            is_rep_g2: [PROB_INIT; NUM_STATES],
            is_rep0_long: [[PROB_INIT; 1 << NUM_POS_BITS_MAX]; NUM_STATES],
            pos_slot: [[PROB_INIT; 64]; NUM_LEN_TO_POS_STATES],
            spec_pos: [PROB_INIT; (1 + NUM_FULL_DISTANCES - END_POS_MODEL_INDEX) as usize],
            align: [PROB_INIT; 16],
            len_dec: LenDecoder::new(),
            rep_len_dec: LenDecoder::new(),
            state: 0,
            reps: [0; 4],
        }
    }

    fn decode_literal(&mut self, rc: &mut RangeDecoder, out: &mut Vec<u8>) {
        let prev_byte = out.last().copied().unwrap_or(0) as u32;
        let lit_state = (((out.len() as u32) & ((1 << self.props.lp) - 1)) << self.props.lc)
            + (prev_byte >> (8 - self.props.lc));
        let probs = &mut self.lit_probs[0x300 * lit_state as usize..];

        let mut symbol = 1usize;
        if self.state >= 7 {
            let rep0 = self.reps[0] as usize;
            let mut match_byte = if rep0 < out.len() {
                out[out.len() - rep0 - 1] as u32
            } else {
                0
            };
            while symbol < 0x100 {
                let match_bit = (match_byte >> 7) & 1;
                match_byte <<= 1;
                let bit = rc.decode_bit(&mut probs[((1 + match_bit as usize) << 8) + symbol]);
                symbol = (symbol << 1) | bit as usize;
                if match_bit != bit {
                    break;
                }
            }
        }
        while symbol < 0x100 {
            symbol = (symbol << 1) | rc.decode_bit(&mut probs[symbol]) as usize;
        }
        out.push(symbol as u8);

        self.state = match self.state {
            0..=3 => 0,
            4..=9 => self.state - 3,
            _ => self.state - 6,
        };
    }

    fn decode_distance(&mut self, rc: &mut RangeDecoder, len: usize) -> u32 {
        let len_state = usize::min(len - MATCH_MIN_LEN, NUM_LEN_TO_POS_STATES - 1);
        let pos_slot = rc.bit_tree_decode(&mut self.pos_slot[len_state], 6);
        if pos_slot < 4 {
            return pos_slot;
        }

        let num_direct_bits = (pos_slot >> 1) - 1;
        let mut dist = (2 | (pos_slot & 1)) << num_direct_bits;
        if pos_slot < END_POS_MODEL_INDEX {
            let base = (dist - pos_slot) as usize;
            dist += rc.bit_tree_reverse_decode(&mut self.spec_pos, base, num_direct_bits);
        } else {
            dist = dist
                .wrapping_add(rc.decode_direct_bits(num_direct_bits - NUM_ALIGN_BITS) << NUM_ALIGN_BITS);
            dist = dist.wrapping_add(rc.bit_tree_reverse_decode(&mut self.align, 0, NUM_ALIGN_BITS));
        }
        dist
    }

    /// Copy `len` bytes from `dist + 1` behind the write position. Stops at
    /// the output budget or on an unserviceable distance.
    fn copy_match(&self, out: &mut Vec<u8>, dist: u32, len: usize, limit: usize) -> bool {
        if dist as usize >= out.len() {
            return false;
        }
        for _ in 0..len {
            if out.len() >= limit {
                break;
            }
            let b = out[out.len() - dist as usize - 1];
            out.push(b);
        }
        true
    }

    /// Run packets until `limit` output bytes exist, the end marker shows
    /// up, or the input runs dry.
    fn decode(&mut self, rc: &mut RangeDecoder, out: &mut Vec<u8>, limit: usize) -> DecodeOutcome {
        let pb_mask = (1usize << self.props.pb) - 1;

        loop {
            if out.len() >= limit {
                return DecodeOutcome::LimitReached;
            }
            if rc.truncated {
                return DecodeOutcome::InputExhausted;
            }

            let pos_state = out.len() & pb_mask;
            if rc.decode_bit(&mut self.is_match[self.state][pos_state]) == 0 {
                self.decode_literal(rc, out);
                continue;
            }

            let len;
            if rc.decode_bit(&mut self.is_rep[self.state]) == 0 {
                // Plain match: shift the distance history
                self.reps[3] = self.reps[2];
                self.reps[2] = self.reps[1];
                self.reps[1] = self.reps[0];
                len = self.len_dec.decode(rc, pos_state);
                let dist = self.decode_distance(rc, len);
                if dist == 0xFFFF_FFFF {
                    return DecodeOutcome::EndMarker;
                }
                self.reps[0] = dist;
                self.state = if self.state < 7 { 7 } else { 10 };
            } else if rc.decode_bit(&mut self.is_rep_g0[self.state]) == 0 {
                if rc.decode_bit(&mut self.is_rep0_long[self.state][pos_state]) == 0 {
                    // Short rep: a single byte at rep0
                    self.state = if self.state < 7 { 9 } else { 11 };
                    if !self.copy_match(out, self.reps[0], 1, limit) {
                        return DecodeOutcome::InputExhausted;
                    }
                    continue;
                }
                len = self.rep_len_dec.decode(rc, pos_state);
                self.state = if self.state < 7 { 8 } else { 11 };
            } else {
                let dist;
                if rc.decode_bit(&mut self.is_rep_g1[self.state]) == 0 {
                    dist = self.reps[1];
                } else {
                    if rc.decode_bit(&mut self.is_rep_g2[self.state]) == 0 {
                        dist = self.reps[2];
                    } else {
                        dist = self.reps[3];
                        self.reps[3] = self.reps[2];
                    }
                    self.reps[2] = self.reps[1];
                }
                self.reps[1] = self.reps[0];
                self.reps[0] = dist;
                len = self.rep_len_dec.decode(rc, pos_state);
                self.state = if self.state < 7 { 8 } else { 11 };
            }

            if !self.copy_match(out, self.reps[0], len, limit) {
                return DecodeOutcome::InputExhausted;
            }
        }
    }
}

/// Decompress a raw LZMA stream (5-byte properties header followed by
/// range-coded data) into at most `max_out` bytes.
pub fn lzma_decompress(src: &[u8], max_out: usize) -> Result<Vec<u8>> {
    let props = LzmaProps::parse(src)?;
    let mut rc = RangeDecoder::new(&src[5..])?;
    let mut dec = LzmaDecoder::new(props);
    let mut out = Vec::with_capacity(usize::min(max_out, 1 << 20));
    dec.decode(&mut rc, &mut out, max_out);
    Ok(out)
}

/// Decompress an LZMA2 chunk stream into at most `max_out` bytes.
///
/// Control byte 0x00 terminates; 0x01/0x02 carry stored chunks; the high
/// bit introduces an LZMA chunk whose header encodes unpack/pack sizes and
/// the reset level. Anything malformed ends decoding with partial output.
pub fn lzma2_decompress(src: &[u8], max_out: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut p = 0usize;
    let mut dec: Option<LzmaDecoder> = None;
    let mut props: Option<LzmaProps> = None;

    loop {
        if out.len() >= max_out || p >= src.len() {
            break;
        }
        let control = src[p];
        p += 1;

        if control == 0 {
            break;
        }
        if control < 0x80 {
            // Stored chunk; 0x01 additionally resets the dictionary
            if control > 2 || p + 2 > src.len() {
                break;
            }
            let size = BigEndian::read_u16(&src[p..p + 2]) as usize + 1;
            p += 2;
            let take = size.min(src.len() - p).min(max_out - out.len());
            out.extend_from_slice(&src[p..p + take]);
            p += size;
            if take < size {
                break;
            }
            continue;
        }

        if p + 4 > src.len() {
            break;
        }
        let unpack_size =
            ((control as usize & 0x1F) << 16) + BigEndian::read_u16(&src[p..p + 2]) as usize + 1;
        let pack_size = BigEndian::read_u16(&src[p + 2..p + 4]) as usize + 1;
        p += 4;

        let reset = (control >> 5) & 0x3;
        if reset >= 2 {
            if p >= src.len() {
                break;
            }
            match LzmaProps::from_lzma2_byte(src[p], max_out as u32) {
                Ok(pr) => props = Some(pr),
                Err(_) => break,
            }
            p += 1;
        }
        let Some(pr) = props else {
            // An LZMA chunk before any properties were ever sent
            break;
        };
        if reset >= 1 || dec.is_none() {
            dec = Some(LzmaDecoder::new(pr));
        }

        let end = usize::min(p + pack_size, src.len());
        let Ok(mut rc) = RangeDecoder::new(&src[p..end]) else {
            break;
        };
        let budget = usize::min(out.len() + unpack_size, max_out);
        if let Some(d) = dec.as_mut() {
            d.decode(&mut rc, &mut out, budget);
        }
        if end < p + pack_size {
            break;
        }
        p = end;
    }

    out
}
