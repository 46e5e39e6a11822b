// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),

    /// A string or blob exceeded its length budget
    TooLarge(&'static str),

    /// Encoding was attempted on state that has not been
    /// synced to its backing store yet
    Unsynced(&'static str),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncodeError({self:?})")
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Error during deserialization
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// String was not valid UTF-8
    Utf8(std::string::FromUtf8Error),

    /// Unsupported format version
    InvalidVersion(u8),

    /// Invalid enum tag (name, raw value)
    InvalidTag((&'static str, u8)),

    /// Invalid block header
    InvalidHeader(&'static str),

    /// A length prefix exceeded its sanity bound
    InvalidLength(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodeError({self:?})")
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::string::FromUtf8Error> for DecodeError {
    fn from(value: std::string::FromUtf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

/// Trait to serialize stuff
pub trait Encode {
    /// Serializes into writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into vector.
    fn encode_into_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut v = vec![];
        self.encode_into(&mut v)?;
        Ok(v)
    }
}

/// Trait to deserialize stuff
pub trait Decode {
    /// Deserializes from reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

// Paths inside an index are bounded; everything larger indicates corruption.
const MAX_STR_LEN: usize = 64 * 1_024;

// Strings are varint-length-prefixed UTF-8.

pub(crate) fn write_str<W: Write>(writer: &mut W, s: &str) -> Result<(), EncodeError> {
    use varint_rs::VarintWriter;

    if s.len() > MAX_STR_LEN {
        return Err(EncodeError::TooLarge("string"));
    }

    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32_varint(s.len() as u32)?;
    writer.write_all(s.as_bytes())?;

    Ok(())
}

pub(crate) fn read_str<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    use varint_rs::VarintReader;

    let len = reader.read_u32_varint()? as usize;

    if len > MAX_STR_LEN {
        return Err(DecodeError::InvalidLength("string"));
    }

    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;

    Ok(String::from_utf8(buf)?)
}
