//! Value encodings for the typed containers.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::DbKind;

/// Converts container values to and from stored bytes
pub trait Codec {
    /// Kind tag recorded for containers using this codec
    const KIND: DbKind;
    type Item;

    fn encode(item: &Self::Item) -> Result<Vec<u8>>;
    fn decode(buf: &[u8]) -> Result<Self::Item>;
}

/// i64 as 8 big-endian bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl Codec for I64Codec {
    const KIND: DbKind = DbKind::LongMap;
    type Item = i64;

    fn encode(item: &i64) -> Result<Vec<u8>> {
        Ok(item.to_be_bytes().to_vec())
    }

    fn decode(buf: &[u8]) -> Result<i64> {
        let bytes = <[u8; 8]>::try_from(buf).map_err(|_| Error::Decode("i64 value is not 8 bytes"))?;
        Ok(i64::from_be_bytes(bytes))
    }
}

/// UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct StrCodec;

impl Codec for StrCodec {
    const KIND: DbKind = DbKind::StringMap;
    type Item = String;

    fn encode(item: &String) -> Result<Vec<u8>> {
        Ok(item.as_bytes().to_vec())
    }

    fn decode(buf: &[u8]) -> Result<String> {
        decode_str(buf)
    }
}

/// Nested `String -> i64` maps
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedMapCodec;

impl Codec for NestedMapCodec {
    const KIND: DbKind = DbKind::MapToMap;
    type Item = HashMap<String, i64>;

    fn encode(item: &HashMap<String, i64>) -> Result<Vec<u8>> {
        Ok(bitcode::encode(item))
    }

    fn decode(buf: &[u8]) -> Result<HashMap<String, i64>> {
        Ok(bitcode::decode(buf)?)
    }
}

/// Set members carry no value
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitCodec;

impl Codec for UnitCodec {
    const KIND: DbKind = DbKind::StringSet;
    type Item = ();

    fn encode(_: &()) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode(buf: &[u8]) -> Result<()> {
        if !buf.is_empty() {
            return Err(Error::Decode("set member carries a value"));
        }
        Ok(())
    }
}

pub(crate) fn decode_str(buf: &[u8]) -> Result<String> {
    String::from_utf8(buf.to_vec()).map_err(|_| Error::Decode("invalid UTF-8"))
}
