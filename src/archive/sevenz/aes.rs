//! The AES-256 + SHA-256 coder used by encrypted 7z archives.
//!
//! Properties carry the key-stretching cycle count, salt and IV. The key is
//! SHA-256 iterated `2^num_cycles_power` times over salt ‖ UTF-16LE
//! password ‖ little-endian counter; `0x3F` cycles selects raw-key mode.

use std::io::{Read, Write};

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use sha2::Digest;

use crate::password::Password;
use crate::{Error, Result};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const BLOCK: usize = 16;

pub(crate) fn derive_key(properties: &[u8], password: &[u8]) -> Result<([u8; 32], [u8; 16])> {
    if properties.is_empty() {
        return Err(Error::invalid("AES properties too short"));
    }
    // Some writers emit a single property byte with an implicit zero second
    // byte.
    let padded;
    let properties = if properties.len() == 1 {
        padded = [properties[0], 0];
        &padded[..]
    } else {
        properties
    };

    let b0 = properties[0];
    let b1 = properties[1];
    let num_cycles_power = b0 & 0x3F;
    let iv_size = (((b0 >> 6) & 1) + (b1 & 0x0F)) as usize;
    let salt_size = (((b0 >> 7) & 1) + (b1 >> 4)) as usize;
    if 2 + salt_size + iv_size > properties.len() {
        return Err(Error::invalid("AES salt and IV overrun the properties"));
    }
    let salt = &properties[2..2 + salt_size];
    let mut iv = [0u8; 16];
    iv[..iv_size].copy_from_slice(&properties[2 + salt_size..2 + salt_size + iv_size]);

    if password.is_empty() {
        return Err(Error::PasswordRequired);
    }

    let key = if num_cycles_power == 0x3F {
        // Raw-key mode: salt then password bytes, no stretching.
        let mut key = [0u8; 32];
        let salt_take = salt_size.min(32);
        key[..salt_take].copy_from_slice(&salt[..salt_take]);
        let take = password.len().min(32 - salt_take);
        key[salt_take..salt_take + take].copy_from_slice(&password[..take]);
        key
    } else {
        let mut sha = sha2::Sha256::new();
        let mut counter = [0u8; 8];
        for _ in 0..(1u64 << num_cycles_power) {
            sha.update(salt);
            sha.update(password);
            sha.update(counter);
            for byte in &mut counter {
                *byte = byte.wrapping_add(1);
                if *byte != 0 {
                    break;
                }
            }
        }
        sha.finalize().into()
    };
    Ok((key, iv))
}

/// Decrypts an AES-256-CBC coder stream.
pub(crate) struct Aes256Sha256Decoder<R> {
    inner: R,
    dec: Aes256CbcDec,
    /// Decrypted bytes not yet delivered.
    out: Vec<u8>,
    out_pos: usize,
    /// Ciphertext tail shorter than one block.
    partial: Vec<u8>,
    done: bool,
}

impl<R: Read> Aes256Sha256Decoder<R> {
    pub(crate) fn new(inner: R, properties: &[u8], password: &Password) -> Result<Self> {
        let (key, iv) = derive_key(properties, password.as_slice())?;
        Ok(Self {
            inner,
            dec: Aes256CbcDec::new(&GenericArray::from(key), &iv.into()),
            out: Vec::new(),
            out_pos: 0,
            partial: Vec::new(),
            done: false,
        })
    }

    fn refill(&mut self) -> std::io::Result<usize> {
        if self.done {
            return Ok(0);
        }
        self.out.clear();
        self.out_pos = 0;

        let mut chunk = [0u8; 512];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            self.done = true;
            if !self.partial.is_empty() {
                // Ciphertext is always block-aligned; a tail means the
                // stream was cut.
                return Err(Error::Truncated.into_io());
            }
            return Ok(0);
        }

        self.partial.extend_from_slice(&chunk[..n]);
        let whole = self.partial.len() - self.partial.len() % BLOCK;
        for block in self.partial[..whole].chunks_exact_mut(BLOCK) {
            let block = GenericArray::from_mut_slice(block);
            self.dec.decrypt_block_mut(block);
        }
        self.out.extend_from_slice(&self.partial[..whole]);
        self.partial.drain(..whole);
        Ok(self.out.len())
    }
}

impl<R: Read> Read for Aes256Sha256Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.out_pos == self.out.len() {
            if self.refill()? == 0 && self.done {
                return Ok(0);
            }
        }
        let n = (self.out.len() - self.out_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        Ok(n)
    }
}

/// Encryption parameters for the writer.
#[derive(Debug, Clone)]
pub struct AesOptions {
    /// The password the key is derived from.
    pub password: Password,
    num_cycles_power: u8,
    salt: Vec<u8>,
    iv: [u8; 16],
}

impl AesOptions {
    /// Derivation parameters with a fresh random IV and the conventional
    /// 2^19 stretching cycles.
    pub fn new(password: Password) -> Result<Self> {
        let mut iv = [0u8; 16];
        getrandom::fill(&mut iv)
            .map_err(|e| Error::invalid(format!("random iv unavailable: {e}")))?;
        Ok(Self {
            password,
            num_cycles_power: 19,
            salt: Vec::new(),
            iv,
        })
    }

    /// The serialized coder properties.
    pub fn properties(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.salt.len() + 16);
        // A 16-byte IV needs the extra high bit in byte 0 plus 15 in the
        // low nibble of byte 1.
        out.push(self.num_cycles_power | 0x40);
        out.push(((self.salt.len() as u8) << 4) | 0x0F);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.iv);
        out
    }
}

/// Encrypts to an AES-256-CBC coder stream, zero-padding the final block.
pub(crate) struct Aes256Sha256Encoder<W> {
    inner: W,
    enc: Aes256CbcEnc,
    partial: Vec<u8>,
}

impl<W: Write> Aes256Sha256Encoder<W> {
    pub(crate) fn new(inner: W, options: &AesOptions) -> Result<Self> {
        let (key, iv) = derive_key(&options.properties(), options.password.as_slice())?;
        Ok(Self {
            inner,
            enc: Aes256CbcEnc::new(&GenericArray::from(key), &iv.into()),
            partial: Vec::new(),
        })
    }

    fn encrypt_out(&mut self, block: &mut [u8; BLOCK]) -> std::io::Result<()> {
        let ga = GenericArray::from_mut_slice(block);
        self.enc.encrypt_block_mut(ga);
        self.inner.write_all(block)
    }

    pub(crate) fn finish(mut self) -> std::io::Result<W> {
        if !self.partial.is_empty() {
            let mut block = [0u8; BLOCK];
            block[..self.partial.len()].copy_from_slice(&self.partial);
            self.encrypt_out(&mut block)?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Aes256Sha256Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut rest = buf;
        if !self.partial.is_empty() {
            let want = BLOCK - self.partial.len();
            let take = want.min(rest.len());
            self.partial.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.partial.len() == BLOCK {
                let mut block = [0u8; BLOCK];
                block.copy_from_slice(&self.partial);
                self.encrypt_out(&mut block)?;
                self.partial.clear();
            }
        }
        for chunk in rest.chunks(BLOCK) {
            if chunk.len() < BLOCK {
                self.partial.extend_from_slice(chunk);
            } else {
                let mut block = [0u8; BLOCK];
                block.copy_from_slice(chunk);
                self.encrypt_out(&mut block)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_padding() {
        let password = Password::from("secret");
        let options = AesOptions::new(password.clone()).unwrap();
        let original = b"not a multiple of sixteen bytes!!".to_vec();

        let mut encoder = Aes256Sha256Encoder::new(Vec::new(), &options).unwrap();
        encoder.write_all(&original).unwrap();
        let encrypted = encoder.finish().unwrap();
        assert_eq!(encrypted.len() % BLOCK, 0);

        let mut decoder =
            Aes256Sha256Decoder::new(encrypted.as_slice(), &options.properties(), &password)
                .unwrap();
        let mut decrypted = Vec::new();
        decoder.read_to_end(&mut decrypted).unwrap();
        // The decoder yields the zero padding too; the folder's unpack size
        // trims it in real use.
        assert_eq!(&decrypted[..original.len()], &original[..]);
    }

    #[test]
    fn missing_password_is_reported() {
        let err = derive_key(&[0x13, 0x00], &[]).unwrap_err();
        assert!(matches!(err, Error::PasswordRequired));
    }

    #[test]
    fn key_derivation_is_deterministic() {
        // Low cycle count keeps the stretching fast; 16-byte IV of 1..=16.
        let mut props = vec![0x02u8 | 0x40, 0x0F];
        props.extend(1..=16u8);
        let (key1, iv1) = derive_key(&props, b"p\0").unwrap();
        let (key2, iv2) = derive_key(&props, b"p\0").unwrap();
        assert_eq!(key1, key2);
        assert_eq!(iv1, iv2);
        assert_eq!(iv1[0], 1);
        assert_eq!(iv1[15], 16);
    }
}
