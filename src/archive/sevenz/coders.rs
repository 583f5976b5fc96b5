//! Decoder dispatch for folder coder chains, and the buffer-to-buffer
//! encoders the writer uses.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use lzma_rust2::filter::bcj::BCJReader;
use lzma_rust2::filter::delta::DeltaReader;
use lzma_rust2::{LZMA2Reader, LZMAReader};

use super::archive::SevenZMethod;
use super::folder::Coder;
use crate::codec::bzip2::{BZip2Reader, BZip2Writer};
use crate::codec::lzma::{Lzma2Writer, LzmaOptions, lzma2_dict_size_from_prop, lzma2_prop_from_dict_size};
use crate::password::Password;
use crate::{Error, Result};

#[cfg(feature = "aes256")]
use super::aes::{Aes256Sha256Decoder, Aes256Sha256Encoder, AesOptions};

/// A decoder stage wrapping the previous stage's output.
pub(crate) enum Decoder<R: Read> {
    Copy(R),
    Lzma(Box<LZMAReader<R>>),
    Lzma2(Box<LZMA2Reader<R>>),
    Bcj(BCJReader<R>),
    Delta(DeltaReader<R>),
    Bzip2(Box<BZip2Reader<R>>),
    Deflate(flate2::bufread::DeflateDecoder<std::io::BufReader<R>>),
    #[cfg(feature = "zstd")]
    Zstd(zstd::Decoder<'static, std::io::BufReader<R>>),
    #[cfg(feature = "brotli")]
    Brotli(brotli::Decompressor<R>),
    #[cfg(feature = "aes256")]
    Aes256Sha256(Box<Aes256Sha256Decoder<R>>),
}

impl<R: Read> Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Decoder::Copy(r) => r.read(buf),
            Decoder::Lzma(r) => r.read(buf),
            Decoder::Lzma2(r) => r.read(buf),
            Decoder::Bcj(r) => r.read(buf),
            Decoder::Delta(r) => r.read(buf),
            Decoder::Bzip2(r) => r.read(buf),
            Decoder::Deflate(r) => r.read(buf),
            #[cfg(feature = "zstd")]
            Decoder::Zstd(r) => r.read(buf),
            #[cfg(feature = "brotli")]
            Decoder::Brotli(r) => r.read(buf),
            #[cfg(feature = "aes256")]
            Decoder::Aes256Sha256(r) => r.read(buf),
        }
    }
}

/// Wraps `input` in the decoder stage `coder` describes.
pub(crate) fn add_decoder<R: Read>(
    input: R,
    uncompressed_len: u64,
    coder: &Coder,
    #[allow(unused)] password: &Password,
) -> Result<Decoder<R>> {
    let method = SevenZMethod::by_id(coder.method_id()).ok_or_else(|| {
        Error::unsupported(format!("7z coder {:02x?}", coder.method_id()))
    })?;
    match method.id() {
        SevenZMethod::ID_COPY => Ok(Decoder::Copy(input)),
        SevenZMethod::ID_LZMA => {
            if coder.properties.len() < 5 {
                return Err(Error::invalid("LZMA properties too short"));
            }
            let props = coder.properties[0];
            let dict_size = (&coder.properties[1..5]).read_u32::<LittleEndian>()?;
            let reader =
                LZMAReader::new_with_props(input, uncompressed_len, props, dict_size, None)
                    .map_err(Error::io)?;
            Ok(Decoder::Lzma(Box::new(reader)))
        }
        SevenZMethod::ID_LZMA2 => {
            if coder.properties.is_empty() {
                return Err(Error::invalid("LZMA2 properties too short"));
            }
            let dict_size = lzma2_dict_size_from_prop(coder.properties[0])?;
            Ok(Decoder::Lzma2(Box::new(LZMA2Reader::new(
                input, dict_size, None,
            ))))
        }
        SevenZMethod::ID_BZIP2 => Ok(Decoder::Bzip2(Box::new(BZip2Reader::new(input)?))),
        SevenZMethod::ID_DEFLATE => Ok(Decoder::Deflate(
            flate2::bufread::DeflateDecoder::new(std::io::BufReader::new(input)),
        )),
        #[cfg(feature = "zstd")]
        SevenZMethod::ID_ZSTD => Ok(Decoder::Zstd(
            zstd::Decoder::new(input).map_err(Error::io)?,
        )),
        #[cfg(feature = "brotli")]
        SevenZMethod::ID_BROTLI => Ok(Decoder::Brotli(brotli::Decompressor::new(input, 4096))),
        SevenZMethod::ID_DELTA => {
            let distance = if coder.properties.is_empty() {
                1
            } else {
                coder.properties[0].wrapping_add(1) as usize
            };
            Ok(Decoder::Delta(DeltaReader::new(input, distance)))
        }
        SevenZMethod::ID_BCJ_X86 => Ok(Decoder::Bcj(BCJReader::new_x86(input, 0))),
        SevenZMethod::ID_BCJ_ARM => Ok(Decoder::Bcj(BCJReader::new_arm(input, 0))),
        SevenZMethod::ID_BCJ_ARM64 => Ok(Decoder::Bcj(BCJReader::new_arm64(input, 0))),
        SevenZMethod::ID_BCJ_ARM_THUMB => Ok(Decoder::Bcj(BCJReader::new_arm_thumb(input, 0))),
        SevenZMethod::ID_BCJ_PPC => Ok(Decoder::Bcj(BCJReader::new_ppc(input, 0))),
        SevenZMethod::ID_BCJ_IA64 => Ok(Decoder::Bcj(BCJReader::new_ia64(input, 0))),
        SevenZMethod::ID_BCJ_SPARC => Ok(Decoder::Bcj(BCJReader::new_sparc(input, 0))),
        #[cfg(feature = "aes256")]
        SevenZMethod::ID_AES256_SHA256 => {
            if password.is_empty() {
                return Err(Error::PasswordRequired);
            }
            let decoder = Aes256Sha256Decoder::new(input, &coder.properties, password)?;
            Ok(Decoder::Aes256Sha256(Box::new(decoder)))
        }
        _ => Err(Error::unsupported(method.name())),
    }
}

/// Per-method encoder options for the writer.
#[derive(Debug, Clone)]
pub enum SevenZCoderOptions {
    /// LZMA2 options.
    Lzma2(LzmaOptions),
    /// BZip2 block size (1..=9).
    Bzip2(u32),
    /// DEFLATE level.
    Deflate(crate::codec::CompressionLevel),
    /// Delta distance (1..=256).
    Delta(u32),
    #[cfg(feature = "zstd")]
    /// Zstandard level.
    Zstd(i32),
    #[cfg(feature = "aes256")]
    /// AES encryption parameters.
    Aes(AesOptions),
}

/// A method plus its options, one link of the writer's content chain.
#[derive(Debug, Clone)]
pub struct SevenZMethodConfiguration {
    /// The coder method.
    pub method: SevenZMethod,
    /// Method-specific options.
    pub options: Option<SevenZCoderOptions>,
}

impl SevenZMethodConfiguration {
    /// Wraps a method with no options.
    pub fn new(method: SevenZMethod) -> Self {
        Self {
            method,
            options: None,
        }
    }

    /// Attaches options.
    pub fn with_options(mut self, options: SevenZCoderOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl From<SevenZMethod> for SevenZMethodConfiguration {
    fn from(method: SevenZMethod) -> Self {
        Self::new(method)
    }
}

/// Applies one encode stage buffer-to-buffer, returning the encoded bytes
/// and the coder properties to record in the header.
pub(crate) fn encode_stage(
    config: &SevenZMethodConfiguration,
    input: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    match config.method.id() {
        SevenZMethod::ID_COPY => Ok((input.to_vec(), Vec::new())),
        SevenZMethod::ID_LZMA2 => {
            let options = match &config.options {
                Some(SevenZCoderOptions::Lzma2(options)) => options.clone(),
                _ => LzmaOptions::default(),
            };
            let mut writer = Lzma2Writer::new(Vec::new(), &options);
            writer.write_all(input).map_err(Error::io)?;
            let encoded = writer.finish().map_err(Error::io)?;
            let props = vec![lzma2_prop_from_dict_size(options.dictionary_size())];
            Ok((encoded, props))
        }
        SevenZMethod::ID_BZIP2 => {
            let level = match &config.options {
                Some(SevenZCoderOptions::Bzip2(level)) => *level,
                _ => 6,
            };
            let mut writer = BZip2Writer::new(Vec::new(), level)?;
            writer.write_all(input).map_err(Error::io)?;
            Ok((writer.finish().map_err(Error::io)?, Vec::new()))
        }
        SevenZMethod::ID_DEFLATE => {
            let level = match &config.options {
                Some(SevenZCoderOptions::Deflate(level)) => *level,
                _ => crate::codec::CompressionLevel::DEFAULT,
            };
            let mut writer =
                flate2::write::DeflateEncoder::new(Vec::new(), level.to_flate2());
            writer.write_all(input).map_err(Error::io)?;
            Ok((writer.finish().map_err(Error::io)?, Vec::new()))
        }
        SevenZMethod::ID_DELTA => {
            let distance = match &config.options {
                Some(SevenZCoderOptions::Delta(distance)) => (*distance).clamp(1, 256) as usize,
                _ => 1,
            };
            // Difference against the byte `distance` back, zero history.
            let mut encoded = Vec::with_capacity(input.len());
            for (i, &byte) in input.iter().enumerate() {
                let prev = if i >= distance { input[i - distance] } else { 0 };
                encoded.push(byte.wrapping_sub(prev));
            }
            Ok((encoded, vec![(distance - 1) as u8]))
        }
        #[cfg(feature = "zstd")]
        SevenZMethod::ID_ZSTD => {
            let level = match &config.options {
                Some(SevenZCoderOptions::Zstd(level)) => *level,
                _ => 3,
            };
            let mut writer = zstd::Encoder::new(Vec::new(), level).map_err(Error::io)?;
            writer.write_all(input).map_err(Error::io)?;
            Ok((writer.finish().map_err(Error::io)?, Vec::new()))
        }
        #[cfg(feature = "aes256")]
        SevenZMethod::ID_AES256_SHA256 => {
            let options = match &config.options {
                Some(SevenZCoderOptions::Aes(options)) => options.clone(),
                _ => return Err(Error::PasswordRequired),
            };
            let mut writer = Aes256Sha256Encoder::new(Vec::new(), &options)?;
            writer.write_all(input).map_err(Error::io)?;
            let encoded = writer.finish().map_err(Error::io)?;
            Ok((encoded, options.properties()))
        }
        _ => Err(Error::unsupported(config.method.name())),
    }
}
