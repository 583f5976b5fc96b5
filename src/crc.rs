//! Checksum state machines used by the container formats.
//!
//! CRC-32 (ISO-HDLC) comes from `crc32fast`; the remaining variants the
//! formats need are implemented here: CRC-16/ARC (LHA headers), CRC-32C
//! (snappy framing), CRC-64/XZ (XZ block checks) and XXHash32 (LZ4 framing).
//! Every type exposes `update`, `reset` and `value`.

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x82F6_3B78
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xC96C_5795_D787_0F42
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = crc16_table();
static CRC32C_TABLE: [u32; 256] = crc32c_table();
static CRC64_TABLE: [u64; 256] = crc64_table();

/// CRC-16/ARC, the variant LHA uses for its header checksums.
#[derive(Debug, Default, Clone)]
pub struct Crc16(u16);

impl Crc16 {
    /// Creates a fresh checksum state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for &b in data {
            crc = (crc >> 8) ^ CRC16_TABLE[((crc ^ b as u16) & 0xFF) as usize];
        }
        self.0 = crc;
    }

    /// Resets to the initial state.
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// The checksum over everything fed so far.
    pub fn value(&self) -> u16 {
        self.0
    }
}

/// CRC-32C (Castagnoli), used by the snappy framing format.
#[derive(Debug, Default, Clone)]
pub struct Crc32C(u32);

impl Crc32C {
    /// Creates a fresh checksum state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = !self.0;
        for &b in data {
            crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ b as u32) & 0xFF) as usize];
        }
        self.0 = !crc;
    }

    /// Resets to the initial state.
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// The checksum over everything fed so far.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// One-shot convenience.
    pub fn hash(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.value()
    }
}

/// CRC-64/XZ (ECMA-182 polynomial, reflected), the default XZ block check.
#[derive(Debug, Default, Clone)]
pub struct Crc64(u64);

impl Crc64 {
    /// Creates a fresh checksum state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = !self.0;
        for &b in data {
            crc = (crc >> 8) ^ CRC64_TABLE[((crc ^ b as u64) & 0xFF) as usize];
        }
        self.0 = !crc;
    }

    /// Resets to the initial state.
    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// The checksum over everything fed so far.
    pub fn value(&self) -> u64 {
        self.0
    }
}

const XXH_PRIME1: u32 = 0x9E37_79B1;
const XXH_PRIME2: u32 = 0x85EB_CA77;
const XXH_PRIME3: u32 = 0xC2B2_AE3D;
const XXH_PRIME4: u32 = 0x27D4_EB2F;
const XXH_PRIME5: u32 = 0x1656_67B1;

/// Streaming XXHash32, used by the LZ4 frame format.
#[derive(Debug, Clone)]
pub struct XxHash32 {
    seed: u32,
    acc: [u32; 4],
    buffer: [u8; 16],
    buffered: usize,
    total: u64,
}

impl XxHash32 {
    /// Creates a new hash state with the given seed.
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            acc: Self::initial_acc(seed),
            buffer: [0; 16],
            buffered: 0,
            total: 0,
        }
    }

    fn initial_acc(seed: u32) -> [u32; 4] {
        [
            seed.wrapping_add(XXH_PRIME1).wrapping_add(XXH_PRIME2),
            seed.wrapping_add(XXH_PRIME2),
            seed,
            seed.wrapping_sub(XXH_PRIME1),
        ]
    }

    #[inline]
    fn round(acc: u32, lane: u32) -> u32 {
        acc.wrapping_add(lane.wrapping_mul(XXH_PRIME2))
            .rotate_left(13)
            .wrapping_mul(XXH_PRIME1)
    }

    /// Feeds `data` into the hash.
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;

        if self.buffered > 0 {
            let want = 16 - self.buffered;
            let take = want.min(data.len());
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];
            if self.buffered < 16 {
                return;
            }
            let buffer = self.buffer;
            self.consume_stripe(&buffer);
            self.buffered = 0;
        }

        let mut chunks = data.chunks_exact(16);
        for stripe in &mut chunks {
            self.consume_stripe(stripe.try_into().expect("exact chunk"));
        }
        let rest = chunks.remainder();
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffered = rest.len();
    }

    #[inline]
    fn consume_stripe(&mut self, stripe: &[u8; 16]) {
        for (i, lane) in stripe.chunks_exact(4).enumerate() {
            let lane = u32::from_le_bytes(lane.try_into().expect("4-byte lane"));
            self.acc[i] = Self::round(self.acc[i], lane);
        }
    }

    /// Resets to the initial state, keeping the seed.
    pub fn reset(&mut self) {
        self.acc = Self::initial_acc(self.seed);
        self.buffered = 0;
        self.total = 0;
    }

    /// The hash over everything fed so far.
    pub fn value(&self) -> u32 {
        let mut hash = if self.total >= 16 {
            self.acc[0]
                .rotate_left(1)
                .wrapping_add(self.acc[1].rotate_left(7))
                .wrapping_add(self.acc[2].rotate_left(12))
                .wrapping_add(self.acc[3].rotate_left(18))
        } else {
            self.seed.wrapping_add(XXH_PRIME5)
        };

        hash = hash.wrapping_add(self.total as u32);

        let mut rest = &self.buffer[..self.buffered];
        while rest.len() >= 4 {
            let lane = u32::from_le_bytes(rest[..4].try_into().expect("4 bytes"));
            hash = hash
                .wrapping_add(lane.wrapping_mul(XXH_PRIME3))
                .rotate_left(17)
                .wrapping_mul(XXH_PRIME4);
            rest = &rest[4..];
        }
        for &b in rest {
            hash = hash
                .wrapping_add((b as u32).wrapping_mul(XXH_PRIME5))
                .rotate_left(11)
                .wrapping_mul(XXH_PRIME1);
        }

        hash ^= hash >> 15;
        hash = hash.wrapping_mul(XXH_PRIME2);
        hash ^= hash >> 13;
        hash = hash.wrapping_mul(XXH_PRIME3);
        hash ^= hash >> 16;
        hash
    }

    /// One-shot convenience.
    pub fn hash(seed: u32, data: &[u8]) -> u32 {
        let mut state = Self::new(seed);
        state.update(data);
        state.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        // CRC-16/ARC check value for "123456789".
        let mut crc = Crc16::new();
        crc.update(b"123456789");
        assert_eq!(crc.value(), 0xBB3D);
    }

    #[test]
    fn crc32c_check_value() {
        assert_eq!(Crc32C::hash(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn crc64_check_value() {
        let mut crc = Crc64::new();
        crc.update(b"123456789");
        assert_eq!(crc.value(), 0x995D_C9BB_DF19_39FA);
    }

    #[test]
    fn crc_update_is_incremental() {
        let mut a = Crc32C::new();
        a.update(b"hello ");
        a.update(b"world");
        assert_eq!(a.value(), Crc32C::hash(b"hello world"));
    }

    #[test]
    fn xxhash32_known_vectors() {
        assert_eq!(XxHash32::hash(0, b""), 0x02CC_5D05);
        assert_eq!(XxHash32::hash(0, b"a"), 0x550D_7456);
        assert_eq!(XxHash32::hash(0, b"abc"), 0x32D1_53FF);
    }

    #[test]
    fn xxhash32_streaming_matches_oneshot() {
        let data: Vec<u8> = (0u32..1000).map(|i| (i * 7 + 3) as u8).collect();
        let mut state = XxHash32::new(0x1234);
        for chunk in data.chunks(7) {
            state.update(chunk);
        }
        assert_eq!(state.value(), XxHash32::hash(0x1234, &data));
    }
}
