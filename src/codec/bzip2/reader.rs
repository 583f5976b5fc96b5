//! BZip2 decompression.

use std::io::Read;

use super::rand::Randomiser;
use super::{
    BASE_BLOCK_SIZE, BLOCK_MAGIC, BZIP2_MAGIC, BzCrc, EOS_MAGIC, GROUP_SIZE, MAX_CODE_LEN_READ,
    MAX_GROUPS, MIN_GROUPS, RUNA, RUNB,
};
use crate::bitio::{BitOrder, BitReader};
use crate::codec::huffman::HuffmanDecoder;
use crate::{Error, Result};

/// Decompresses a BZip2 stream.
pub struct BZip2Reader<R: Read> {
    bits: BitReader<R>,
    max_block_len: usize,
    combined_crc: u32,
    block: Option<BlockState>,
    eos: bool,
}

impl<R: Read> BZip2Reader<R> {
    /// Parses the stream header (`BZh` + block-size digit).
    pub fn new(inner: R) -> Result<Self> {
        let mut bits = BitReader::new(inner, BitOrder::Msb);
        let b0 = bits.read_bits(8)? as u8;
        let b1 = bits.read_bits(8)? as u8;
        let h = bits.read_bits(8)? as u8;
        let digit = bits.read_bits(8)? as u8;
        if [b0, b1] != BZIP2_MAGIC || h != b'h' {
            return Err(Error::invalid_at(0, "bad bzip2 stream magic"));
        }
        if !(b'1'..=b'9').contains(&digit) {
            return Err(Error::invalid_at(3, "bad bzip2 block size digit"));
        }
        Ok(Self {
            bits,
            max_block_len: (digit - b'0') as usize * BASE_BLOCK_SIZE,
            combined_crc: 0,
            block: None,
            eos: false,
        })
    }

    fn next_block(&mut self) -> Result<bool> {
        let magic =
            ((self.bits.read_bits(24)? as u64) << 24) | self.bits.read_bits(24)? as u64;
        if magic == EOS_MAGIC {
            let expected = self.bits.read_bits(32)?;
            if expected != self.combined_crc {
                return Err(Error::invalid("bzip2 combined CRC mismatch"));
            }
            self.eos = true;
            return Ok(false);
        }
        if magic != BLOCK_MAGIC {
            return Err(Error::invalid("bad bzip2 block magic"));
        }
        let state = self.read_block()?;
        self.block = Some(state);
        Ok(true)
    }

    fn read_block(&mut self) -> Result<BlockState> {
        let expected_crc = self.bits.read_bits(32)?;
        let randomised = self.bits.read_bit()?;
        let orig_ptr = self.bits.read_bits(24)? as usize;

        // Symbol usage maps.
        let in_use16 = self.bits.read_bits(16)?;
        let mut in_use = [false; 256];
        for i in 0..16 {
            if in_use16 & (1 << (15 - i)) != 0 {
                let map = self.bits.read_bits(16)?;
                for j in 0..16 {
                    if map & (1 << (15 - j)) != 0 {
                        in_use[i * 16 + j] = true;
                    }
                }
            }
        }
        let seq_to_unseq: Vec<u8> = (0..256u16)
            .filter(|&v| in_use[v as usize])
            .map(|v| v as u8)
            .collect();
        let n_in_use = seq_to_unseq.len();
        if n_in_use == 0 {
            return Err(Error::invalid("bzip2 block uses no symbols"));
        }
        let alpha_size = n_in_use + 2;
        let eob = (n_in_use + 1) as u16;

        let n_groups = self.bits.read_bits(3)? as usize;
        if !(MIN_GROUPS..=MAX_GROUPS).contains(&n_groups) {
            return Err(Error::invalid("bzip2 group count outside 2..=6"));
        }
        let n_selectors = self.bits.read_bits(15)? as usize;
        if n_selectors == 0 {
            return Err(Error::invalid("bzip2 block has no selectors"));
        }

        // Selectors, MTF-coded over the table ids in unary.
        let mut order: Vec<u8> = (0..n_groups as u8).collect();
        let mut selectors = Vec::with_capacity(n_selectors);
        for _ in 0..n_selectors {
            let mut j = 0usize;
            while self.bits.read_bit()? {
                j += 1;
                if j >= n_groups {
                    return Err(Error::invalid("bzip2 selector outside group range"));
                }
            }
            let table = order.remove(j);
            order.insert(0, table);
            selectors.push(table);
        }

        // Delta-coded code lengths, then decode tables.
        let mut decoders = Vec::with_capacity(n_groups);
        for _ in 0..n_groups {
            let mut lengths = vec![0u8; alpha_size];
            let mut curr = self.bits.read_bits(5)? as i32;
            for slot in lengths.iter_mut() {
                loop {
                    if !(1..=MAX_CODE_LEN_READ as i32).contains(&curr) {
                        return Err(Error::invalid("bzip2 code length outside 1..=20"));
                    }
                    if !self.bits.read_bit()? {
                        break;
                    }
                    if self.bits.read_bit()? {
                        curr -= 1;
                    } else {
                        curr += 1;
                    }
                }
                *slot = curr as u8;
            }
            decoders.push(HuffmanDecoder::new(&lengths)?);
        }

        // Stage decode: Huffman symbols → zero-runs + MTF values → BWT column.
        let mut ll8: Vec<u8> = Vec::with_capacity(self.max_block_len.min(1 << 20));
        let mut counts = [0u32; 256];
        let mut mtf: Vec<u8> = seq_to_unseq.clone();
        let mut group_count = 0usize;
        let mut group_no = 0usize;
        let mut table = &decoders[selectors[0] as usize];
        let mut run = 0u64;
        let mut run_power = 0u32;

        macro_rules! flush_run {
            () => {
                if run > 0 {
                    let byte = mtf[0];
                    if ll8.len() + run as usize > self.max_block_len {
                        return Err(Error::invalid("bzip2 block overflows declared size"));
                    }
                    counts[byte as usize] += run as u32;
                    ll8.resize(ll8.len() + run as usize, byte);
                    run = 0;
                    run_power = 0;
                }
            };
        }

        loop {
            if group_count == 0 {
                if group_no >= selectors.len() {
                    return Err(Error::invalid("bzip2 block exhausted its selectors"));
                }
                table = &decoders[selectors[group_no] as usize];
                group_no += 1;
                group_count = GROUP_SIZE;
            }
            group_count -= 1;

            let sym = table.decode(&mut self.bits)?;
            if sym == RUNA || sym == RUNB {
                let digit = if sym == RUNA { 1u64 } else { 2u64 };
                run += digit << run_power;
                run_power += 1;
                continue;
            }
            flush_run!();
            if sym == eob {
                break;
            }
            if sym as usize > n_in_use {
                return Err(Error::invalid("bzip2 MTF symbol out of range"));
            }
            let pos = sym as usize - 1;
            let byte = mtf.remove(pos);
            mtf.insert(0, byte);
            if ll8.len() >= self.max_block_len {
                return Err(Error::invalid("bzip2 block overflows declared size"));
            }
            counts[byte as usize] += 1;
            ll8.push(byte);
        }

        let n = ll8.len();
        if n == 0 || orig_ptr >= n {
            return Err(Error::invalid("bzip2 original pointer out of range"));
        }

        // Inverse BWT: tt[k] walks the rotation chain from orig_ptr.
        let mut cftab = [0u32; 257];
        for (value, &count) in counts.iter().enumerate() {
            cftab[value + 1] = count;
        }
        for i in 1..257 {
            cftab[i] += cftab[i - 1];
        }
        let mut tt = vec![0u32; n];
        for (i, &b) in ll8.iter().enumerate() {
            tt[cftab[b as usize] as usize] = i as u32;
            cftab[b as usize] += 1;
        }

        Ok(BlockState {
            ll8,
            tt,
            pos: 0,
            next_pos_initialised: false,
            orig_ptr: orig_ptr as u32,
            remaining: n,
            randomiser: randomised.then(Randomiser::new),
            crc: BzCrc::new(),
            expected_crc,
            rle_last: -1,
            rle_equal: 0,
            rle_pending: 0,
        })
    }
}

impl<R: Read> Read for BZip2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.eos {
                return Ok(0);
            }
            if self.block.is_none() && !self.next_block().map_err(Error::into_io)? {
                return Ok(0);
            }

            let block = self.block.as_mut().expect("block set above");
            let n = block.fill(buf);
            if n > 0 {
                return Ok(n);
            }
            // Block exhausted: verify its CRC and fold it into the stream CRC.
            let crc = block.crc.value();
            if crc != block.expected_crc {
                return Err(Error::invalid("bzip2 block CRC mismatch").into_io());
            }
            self.combined_crc = self.combined_crc.rotate_left(1) ^ crc;
            self.block = None;
        }
    }
}

/// Decoded-block state: walks the inverse-BWT chain and undoes the
/// randomisation and initial run-length coding on demand.
struct BlockState {
    ll8: Vec<u8>,
    tt: Vec<u32>,
    pos: u32,
    next_pos_initialised: bool,
    orig_ptr: u32,
    remaining: usize,
    randomiser: Option<Randomiser>,
    crc: BzCrc,
    expected_crc: u32,
    rle_last: i32,
    rle_equal: u32,
    rle_pending: u32,
}

impl BlockState {
    /// Next byte of the de-randomised BWT output, or `None` at block end.
    fn next_bwt_byte(&mut self) -> Option<u8> {
        if self.remaining == 0 {
            return None;
        }
        if !self.next_pos_initialised {
            self.pos = self.tt[self.orig_ptr as usize];
            self.next_pos_initialised = true;
        }
        let mut byte = self.ll8[self.pos as usize];
        self.pos = self.tt[self.pos as usize];
        self.remaining -= 1;
        if let Some(randomiser) = &mut self.randomiser {
            byte ^= randomiser.next_mask();
        }
        Some(byte)
    }

    /// Copies decoded plain bytes into `out`, inverting the RLE1 stage.
    fn fill(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.rle_pending > 0 {
                let byte = self.rle_last as u8;
                let n = (self.rle_pending as usize).min(out.len() - written);
                out[written..written + n].fill(byte);
                for _ in 0..n {
                    self.crc.update_byte(byte);
                }
                self.rle_pending -= n as u32;
                written += n;
                continue;
            }
            let Some(byte) = self.next_bwt_byte() else {
                break;
            };
            if self.rle_equal == 4 {
                // The byte after a run of four is a repeat count.
                self.rle_pending = byte as u32;
                self.rle_equal = 0;
                continue;
            }
            if byte as i32 == self.rle_last {
                self.rle_equal += 1;
            } else {
                self.rle_equal = 1;
                self.rle_last = byte as i32;
            }
            self.crc.update_byte(byte);
            out[written] = byte;
            written += 1;
        }
        written
    }
}
