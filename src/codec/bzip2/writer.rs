//! BZip2 compression.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;

use super::blocksort::block_sort;
use super::{
    BASE_BLOCK_SIZE, BLOCK_MAGIC, BZIP2_MAGIC, BzCrc, EOS_MAGIC, GROUP_SIZE, MAX_ALPHA_SIZE,
    MAX_CODE_LEN_WRITE, MAX_GROUPS, MIN_GROUPS, RUNA, RUNB,
};
use crate::bitio::BitWriter;
use crate::{Error, Result};

/// Compresses data into a BZip2 stream.
///
/// `write` feeds the run-length pre-encoder; whenever a block fills up it is
/// sorted, transformed and emitted. `finish` flushes the final block and the
/// end-of-stream record.
pub struct BZip2Writer<W: Write> {
    bits: BitWriter<W>,
    block: Vec<u8>,
    block_capacity: usize,
    current_byte: i32,
    run_length: u32,
    block_crc: BzCrc,
    combined_crc: u32,
    ptr: Vec<u32>,
}

impl<W: Write> BZip2Writer<W> {
    /// Creates a writer with the given block size multiplier (1..=9, each
    /// step adds 100 000 bytes of block capacity) and emits the stream header.
    pub fn new(inner: W, block_size: u32) -> Result<Self> {
        if !(1..=9).contains(&block_size) {
            return Err(Error::invalid(format!(
                "bzip2 block size {block_size} outside 1..=9"
            )));
        }
        let mut bits = BitWriter::new(inner);
        bits.write_bits(BZIP2_MAGIC[0] as u32, 8).map_err(Error::io)?;
        bits.write_bits(BZIP2_MAGIC[1] as u32, 8).map_err(Error::io)?;
        bits.write_bits(b'h' as u32, 8).map_err(Error::io)?;
        bits.write_bits((b'0' + block_size as u8) as u32, 8)
            .map_err(Error::io)?;

        Ok(Self {
            bits,
            block: Vec::with_capacity(block_size as usize * BASE_BLOCK_SIZE),
            // Slack for the worst-case run flush, as in the reference encoder.
            block_capacity: block_size as usize * BASE_BLOCK_SIZE - 20,
            current_byte: -1,
            run_length: 0,
            block_crc: BzCrc::new(),
            combined_crc: 0,
            ptr: Vec::new(),
        })
    }

    /// Flushes the pending run and block, writes the end-of-stream record and
    /// returns the inner writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        self.flush_run()?;
        if !self.block.is_empty() {
            self.compress_block()?;
        }
        self.bits.write_bits((EOS_MAGIC >> 24) as u32, 24)?;
        self.bits.write_bits((EOS_MAGIC & 0xFF_FFFF) as u32, 24)?;
        self.bits.write_bits(self.combined_crc, 32)?;
        self.bits.finish()
    }

    fn flush_run(&mut self) -> std::io::Result<()> {
        if self.current_byte < 0 {
            return Ok(());
        }
        let byte = self.current_byte as u8;
        let run = self.run_length;

        if self.block.len() + 5 > self.block_capacity {
            self.compress_block()?;
        }

        for _ in 0..run {
            self.block_crc.update_byte(byte);
        }
        if run < 4 {
            for _ in 0..run {
                self.block.push(byte);
            }
        } else {
            self.block.extend_from_slice(&[byte; 4]);
            self.block.push((run - 4) as u8);
        }
        self.current_byte = -1;
        self.run_length = 0;
        Ok(())
    }

    fn compress_block(&mut self) -> std::io::Result<()> {
        let block_crc = std::mem::replace(&mut self.block_crc, BzCrc::new()).value();
        self.combined_crc = self.combined_crc.rotate_left(1) ^ block_crc;

        let (randomised, orig_ptr) = block_sort(&mut self.block, &mut self.ptr);

        let n = self.block.len();
        let mut bwt = vec![0u8; n];
        let mut in_use = [false; 256];
        for i in 0..n {
            let p = self.ptr[i] as usize;
            let b = self.block[if p == 0 { n - 1 } else { p - 1 }];
            bwt[i] = b;
            in_use[b as usize] = true;
        }

        let mut unseq_map = [0u8; 256];
        let mut n_in_use = 0usize;
        for (value, used) in in_use.iter().enumerate() {
            if *used {
                unseq_map[value] = n_in_use as u8;
                n_in_use += 1;
            }
        }
        let eob = (n_in_use + 1) as u16;
        let alpha_size = n_in_use + 2;

        let (mtfv, freq) = mtf_and_rle2(&bwt, &unseq_map, n_in_use, alpha_size);

        self.bits.write_bits((BLOCK_MAGIC >> 24) as u32, 24)?;
        self.bits.write_bits((BLOCK_MAGIC & 0xFF_FFFF) as u32, 24)?;
        self.bits.write_bits(block_crc, 32)?;
        self.bits.write_bits(randomised as u32, 1)?;
        self.bits.write_bits(orig_ptr, 24)?;

        // Symbol usage maps, 16 groups of 16.
        let mut in_use16 = 0u32;
        for i in 0..16 {
            if in_use[i * 16..(i + 1) * 16].iter().any(|&u| u) {
                in_use16 |= 1 << (15 - i);
            }
        }
        self.bits.write_bits(in_use16, 16)?;
        for i in 0..16 {
            if in_use16 & (1 << (15 - i)) != 0 {
                let mut map = 0u32;
                for j in 0..16 {
                    if in_use[i * 16 + j] {
                        map |= 1 << (15 - j);
                    }
                }
                self.bits.write_bits(map, 16)?;
            }
        }

        debug_assert_eq!(*mtfv.last().expect("coded block"), eob);
        self.send_mtf_values(&mtfv, &freq, alpha_size)?;

        self.block.clear();
        Ok(())
    }

    fn send_mtf_values(
        &mut self,
        mtfv: &[u16],
        freq: &[u32],
        alpha_size: usize,
    ) -> std::io::Result<()> {
        let n_mtf = mtfv.len();
        let n_groups = match n_mtf {
            0..200 => 2,
            200..600 => 3,
            600..1200 => 4,
            1200..2400 => 5,
            _ => 6,
        }
        .clamp(MIN_GROUPS, MAX_GROUPS);

        // Seed each table with an exclusive slice of the frequency mass.
        let mut lengths = vec![[0u8; MAX_ALPHA_SIZE]; n_groups];
        let mut remaining = n_mtf as i64;
        let mut gs = 0usize;
        for t in 0..n_groups {
            let target = remaining / (n_groups - t) as i64;
            let mut ge = gs;
            let mut acc = 0i64;
            while acc < target && ge < alpha_size {
                acc += freq[ge] as i64;
                ge += 1;
            }
            if ge > gs + 1 && t != 0 && t != n_groups - 1 && (n_groups - t) % 2 == 1 {
                // The reference encoder biases alternate slices one symbol short.
                ge -= 1;
                acc -= freq[ge] as i64;
            }
            for v in 0..alpha_size {
                lengths[t][v] = if (gs..ge).contains(&v) { 0 } else { 15 };
            }
            gs = ge;
            remaining -= acc;
        }

        let n_group_slots = n_mtf.div_ceil(GROUP_SIZE);
        let mut selectors = vec![0u8; n_group_slots];

        // Refine table assignment and code lengths over a few passes.
        for _ in 0..4 {
            let mut rfreq = vec![[0u32; MAX_ALPHA_SIZE]; n_groups];
            for (group, chunk) in mtfv.chunks(GROUP_SIZE).enumerate() {
                let mut best = 0usize;
                let mut best_cost = u32::MAX;
                for (t, table) in lengths.iter().enumerate() {
                    let cost: u32 = chunk.iter().map(|&s| table[s as usize] as u32).sum();
                    if cost < best_cost {
                        best_cost = cost;
                        best = t;
                    }
                }
                selectors[group] = best as u8;
                for &s in chunk {
                    rfreq[best][s as usize] += 1;
                }
            }
            for t in 0..n_groups {
                make_code_lengths(&mut lengths[t], &rfreq[t], alpha_size, MAX_CODE_LEN_WRITE);
            }
        }

        let codes = lengths
            .iter()
            .map(|table| assign_codes(table, alpha_size))
            .collect::<Vec<_>>();

        // Selectors are MTF-coded over the table ids, written in unary.
        let mut order: Vec<u8> = (0..n_groups as u8).collect();
        let mut selector_mtf = Vec::with_capacity(selectors.len());
        for &sel in &selectors {
            let pos = order.iter().position(|&t| t == sel).expect("table id");
            order.remove(pos);
            order.insert(0, sel);
            selector_mtf.push(pos as u8);
        }

        self.bits.write_bits(n_groups as u32, 3)?;
        self.bits.write_bits(selectors.len() as u32, 15)?;
        for &s in &selector_mtf {
            for _ in 0..s {
                self.bits.write_bits(1, 1)?;
            }
            self.bits.write_bits(0, 1)?;
        }

        // Delta-coded code lengths per table.
        for table in &lengths {
            let mut curr = table[0] as i32;
            self.bits.write_bits(curr as u32, 5)?;
            for &len in table[..alpha_size].iter() {
                let len = len as i32;
                while curr < len {
                    self.bits.write_bits(0b10, 2)?;
                    curr += 1;
                }
                while curr > len {
                    self.bits.write_bits(0b11, 2)?;
                    curr -= 1;
                }
                self.bits.write_bits(0, 1)?;
            }
        }

        for (group, chunk) in mtfv.chunks(GROUP_SIZE).enumerate() {
            let t = selectors[group] as usize;
            for &s in chunk {
                let (code, len) = codes[t][s as usize];
                self.bits.write_bits(code, len)?;
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for BZip2Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for &byte in buf {
            if self.current_byte == byte as i32 && self.run_length < 255 {
                self.run_length += 1;
            } else {
                self.flush_run()?;
                self.current_byte = byte as i32;
                self.run_length = 1;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Blocks are only emitted when full or at finish; nothing to do here.
        Ok(())
    }
}

/// Move-to-front transform plus zero-run (RUNA/RUNB) coding of the BWT
/// output. Returns the coded symbol stream and its frequency table.
fn mtf_and_rle2(
    bwt: &[u8],
    unseq_map: &[u8; 256],
    n_in_use: usize,
    alpha_size: usize,
) -> (Vec<u16>, Vec<u32>) {
    let eob = (n_in_use + 1) as u16;
    let mut mtf: Vec<u8> = (0..n_in_use as u8).collect();
    let mut out = Vec::with_capacity(bwt.len() + 16);
    let mut freq = vec![0u32; alpha_size];
    let mut zero_run = 0u64;

    let mut flush_zero_run = |run: &mut u64, out: &mut Vec<u16>, freq: &mut Vec<u32>| {
        let mut c = *run;
        while c > 0 {
            if c & 1 != 0 {
                out.push(RUNA);
                freq[RUNA as usize] += 1;
                c = (c - 1) / 2;
            } else {
                out.push(RUNB);
                freq[RUNB as usize] += 1;
                c = (c - 2) / 2;
            }
        }
        *run = 0;
    };

    for &b in bwt {
        let v = unseq_map[b as usize];
        let pos = mtf.iter().position(|&m| m == v).expect("symbol in use");
        if pos == 0 {
            zero_run += 1;
            continue;
        }
        flush_zero_run(&mut zero_run, &mut out, &mut freq);
        mtf.remove(pos);
        mtf.insert(0, v);
        let sym = (pos + 1) as u16;
        out.push(sym);
        freq[sym as usize] += 1;
    }
    flush_zero_run(&mut zero_run, &mut out, &mut freq);
    out.push(eob);
    freq[eob as usize] += 1;
    (out, freq)
}

/// Builds length-limited Huffman code lengths for `freq`, repeatedly
/// flattening the weights until the deepest leaf fits `max_len`.
fn make_code_lengths(lengths: &mut [u8; MAX_ALPHA_SIZE], freq: &[u32], alpha_size: usize, max_len: u8) {
    let mut weights: Vec<u64> = freq[..alpha_size]
        .iter()
        .map(|&f| (f as u64).max(1))
        .collect();

    loop {
        let depths = huffman_depths(&weights);
        let deepest = depths.iter().copied().max().unwrap_or(0);
        if deepest <= max_len {
            for (slot, depth) in lengths[..alpha_size].iter_mut().zip(depths) {
                *slot = depth;
            }
            return;
        }
        for w in &mut weights {
            *w = (*w / 2) + 1;
        }
    }
}

fn huffman_depths(weights: &[u64]) -> Vec<u8> {
    let n = weights.len();
    debug_assert!(n >= 2);
    // Internal nodes take indices n.., parent links recover the depths.
    let mut parent = vec![usize::MAX; 2 * n];
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = weights
        .iter()
        .enumerate()
        .map(|(i, &w)| Reverse((w, i)))
        .collect();
    let mut next = n;
    while heap.len() > 1 {
        let Reverse((wa, a)) = heap.pop().expect("heap");
        let Reverse((wb, b)) = heap.pop().expect("heap");
        parent[a] = next;
        parent[b] = next;
        heap.push(Reverse((wa + wb, next)));
        next += 1;
    }

    let mut depths = vec![0u8; n];
    for i in 0..n {
        let mut depth = 0u8;
        let mut node = i;
        while parent[node] != usize::MAX {
            node = parent[node];
            depth += 1;
        }
        depths[i] = depth;
    }
    depths
}

/// Canonical code assignment: codes increase within a length, lengths taken
/// shortest first, symbols in index order within a length.
fn assign_codes(lengths: &[u8; MAX_ALPHA_SIZE], alpha_size: usize) -> Vec<(u32, u32)> {
    let min_len = lengths[..alpha_size].iter().copied().min().unwrap_or(0) as u32;
    let max_len = lengths[..alpha_size].iter().copied().max().unwrap_or(0) as u32;
    let mut codes = vec![(0u32, 0u32); alpha_size];
    let mut code = 0u32;
    for len in min_len..=max_len {
        for (sym, &l) in lengths[..alpha_size].iter().enumerate() {
            if l as u32 == len {
                codes[sym] = (code, len);
                code += 1;
            }
        }
        code <<= 1;
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huffman_depths_are_optimal_for_simple_weights() {
        let depths = huffman_depths(&[1, 1, 2, 4]);
        assert_eq!(depths, vec![3, 3, 2, 1]);
    }

    #[test]
    fn code_lengths_respect_limit() {
        let mut freq = [0u32; 32];
        for (i, f) in freq.iter_mut().enumerate() {
            *f = 1 << i.min(24);
        }
        let mut lengths = [0u8; MAX_ALPHA_SIZE];
        make_code_lengths(&mut lengths, &freq, 32, MAX_CODE_LEN_WRITE);
        assert!(lengths[..32].iter().all(|&l| (1..=MAX_CODE_LEN_WRITE).contains(&l)));
    }

    #[test]
    fn zero_run_coding_counts() {
        // Four identical bytes become a RUNA/RUNB pair: 4 = 1·1 + 2·... (1 then RUNB)
        let unseq: [u8; 256] = std::array::from_fn(|i| i as u8);
        let (out, _) = mtf_and_rle2(&[0, 0, 0, 0], &unseq, 1, 3);
        // Run of 4 in bijective base 2 is RUNB (2·2^0) then RUNA (1·2^1), then EOB.
        assert_eq!(out, vec![RUNB, RUNA, 2]);
    }
}
