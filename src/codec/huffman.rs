//! Canonical Huffman decoding.
//!
//! Tables are built from an array of code lengths (0 = symbol unused). The
//! decoder keeps three arrays indexed by code length: `limit[len]` is the
//! largest code of that length, `bias[len]` maps a code to its index in
//! `sorted`, and `sorted` holds the symbols ordered by (length, symbol).
//! This is the table layout the BZip2 stage decoder uses.

use std::io::Read;

use crate::bitio::BitReader;
use crate::{Error, Result};

/// Longest code length any caller may request.
pub const MAX_CODE_LEN: usize = 30;

/// A canonical Huffman code table ready for decoding.
#[derive(Debug, Clone)]
pub struct HuffmanDecoder {
    min_len: u32,
    max_len: u32,
    /// Largest code of each length, left-justified comparisons use raw codes.
    limit: [i32; MAX_CODE_LEN + 2],
    /// `first_code[len] - first_index[len]`; subtracting it from a code yields
    /// the index into `sorted`.
    bias: [i32; MAX_CODE_LEN + 2],
    sorted: Vec<u16>,
}

impl HuffmanDecoder {
    /// Builds decode tables from per-symbol code lengths.
    ///
    /// Fails when a length exceeds [`MAX_CODE_LEN`], when no symbol is coded,
    /// or when the lengths oversubscribe the code space (Kraft violation).
    pub fn new(lengths: &[u8]) -> Result<Self> {
        let mut count = [0u32; MAX_CODE_LEN + 2];
        let mut min_len = MAX_CODE_LEN as u32;
        let mut max_len = 0u32;
        let mut coded = 0usize;
        for &len in lengths {
            if len == 0 {
                continue;
            }
            if len as usize > MAX_CODE_LEN {
                return Err(Error::invalid(format!(
                    "huffman code length {len} exceeds {MAX_CODE_LEN}"
                )));
            }
            count[len as usize] += 1;
            min_len = min_len.min(len as u32);
            max_len = max_len.max(len as u32);
            coded += 1;
        }
        if coded == 0 {
            return Err(Error::invalid("huffman table has no coded symbols"));
        }

        // Kraft inequality: the lengths must not oversubscribe the code space.
        let mut space: u64 = 0;
        for len in 1..=max_len {
            space += (count[len as usize] as u64) << (max_len - len);
        }
        if space > 1u64 << max_len {
            return Err(Error::invalid("huffman code lengths violate Kraft"));
        }

        let mut sorted = Vec::with_capacity(coded);
        for len in min_len..=max_len {
            for (symbol, &l) in lengths.iter().enumerate() {
                if l as u32 == len {
                    sorted.push(symbol as u16);
                }
            }
        }

        let mut limit = [0i32; MAX_CODE_LEN + 2];
        let mut bias = [0i32; MAX_CODE_LEN + 2];
        let mut code: i32 = 0;
        let mut index: i32 = 0;
        for len in min_len..=max_len {
            let n = count[len as usize] as i32;
            bias[len as usize] = code - index;
            index += n;
            limit[len as usize] = code + n - 1;
            code = (code + n) << 1;
        }

        Ok(Self {
            min_len,
            max_len,
            limit,
            bias,
            sorted,
        })
    }

    /// The shortest code length in the table.
    pub fn min_len(&self) -> u32 {
        self.min_len
    }

    /// The longest code length in the table.
    pub fn max_len(&self) -> u32 {
        self.max_len
    }

    /// Decodes one symbol from an MSB-first bit stream.
    ///
    /// A truncated stream fails with [`Error::Truncated`]; a code outside the
    /// table (possible for incomplete codes) fails as invalid.
    pub fn decode<R: Read>(&self, bits: &mut BitReader<R>) -> Result<u16> {
        let mut len = self.min_len;
        let mut code = bits.read_bits(len)? as i32;
        loop {
            if code <= self.limit[len as usize] {
                let index = code - self.bias[len as usize];
                // limit[] for zero-count lengths is below any reachable code,
                // so a hit here always indexes into bounds.
                return Ok(self.sorted[index as usize]);
            }
            if len >= self.max_len {
                return Err(Error::invalid("invalid huffman code"));
            }
            code = (code << 1) | bits.read_bits(1)? as i32;
            len += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitio::{BitOrder, BitWriter};

    /// Canonical code assignment mirroring the decoder's table maths, used to
    /// produce test bitstreams.
    fn assign_codes(lengths: &[u8]) -> Vec<(u32, u32)> {
        let max = *lengths.iter().max().unwrap() as u32;
        let min = *lengths.iter().filter(|&&l| l > 0).min().unwrap() as u32;
        let mut codes = vec![(0u32, 0u32); lengths.len()];
        let mut code = 0u32;
        for len in min..=max {
            for (sym, &l) in lengths.iter().enumerate() {
                if l as u32 == len {
                    codes[sym] = (code, len);
                    code += 1;
                }
            }
            code <<= 1;
        }
        codes
    }

    #[test]
    fn roundtrip_every_symbol() {
        let lengths = [3u8, 3, 3, 3, 3, 2, 4, 4];
        let decoder = HuffmanDecoder::new(&lengths).unwrap();
        let codes = assign_codes(&lengths);

        let mut out = Vec::new();
        let mut writer = BitWriter::new(&mut out);
        for (code, len) in &codes {
            writer.write_bits(*code, *len).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = BitReader::new(&out[..], BitOrder::Msb);
        for symbol in 0..lengths.len() as u16 {
            assert_eq!(decoder.decode(&mut reader).unwrap(), symbol);
        }
    }

    #[test]
    fn unused_symbols_are_skipped() {
        let lengths = [0u8, 1, 0, 1];
        let decoder = HuffmanDecoder::new(&lengths).unwrap();
        let mut reader = BitReader::new(&[0b01000000u8][..], BitOrder::Msb);
        assert_eq!(decoder.decode(&mut reader).unwrap(), 1);
        assert_eq!(decoder.decode(&mut reader).unwrap(), 3);
    }

    #[test]
    fn kraft_violation_rejected() {
        // Three one-bit codes cannot exist.
        assert!(HuffmanDecoder::new(&[1, 1, 1]).is_err());
    }

    #[test]
    fn over_long_code_rejected() {
        let mut lengths = [0u8; 2];
        lengths[0] = 31;
        lengths[1] = 31;
        assert!(HuffmanDecoder::new(&lengths).is_err());
    }

    #[test]
    fn truncated_bitstream_fails_truncated() {
        let lengths = [5u8, 5, 5, 5];
        let decoder = HuffmanDecoder::new(&lengths).unwrap();
        let data = [0b00000_000u8];
        let mut reader = BitReader::new(&data[..], BitOrder::Msb);
        // First decode consumes 5 bits, the second starves mid-codeword.
        assert_eq!(decoder.decode(&mut reader).unwrap(), 0);
        let err = decoder.decode(&mut reader).unwrap_err();
        assert!(matches!(err, Error::Truncated));
    }

    #[test]
    fn empty_table_rejected() {
        assert!(HuffmanDecoder::new(&[0, 0, 0]).is_err());
    }
}
