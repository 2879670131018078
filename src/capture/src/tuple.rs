// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Order-preserving encoding of row-key tuples.
//!
//! Backfill cursors and replication row keys are serialized with this codec
//! so that the rest of the engine can compare keys bytewise: for any two
//! tuples `x` and `y`, `encode_tuple(&x) < encode_tuple(&y)` holds exactly
//! when `x < y` under [`Element`]'s ordering. The codec is a pure function
//! of its input and round-trips through [`decode_tuple`].
//!
//! Cross-type ordering is fixed by the type codes: null sorts before byte
//! strings, then text, nested tuples, integers, floats and booleans.
//! Signed and unsigned integers share one code family and interleave in
//! numeric order; floats order by the IEEE-754 total order.

use std::cmp::Ordering;

// Type codes. Integers occupy the whole 0x0c..=0x1c band, with the code
// itself encoding sign and magnitude width so that encodings of different
// lengths still compare correctly.
const NULL_CODE: u8 = 0x00;
const BYTES_CODE: u8 = 0x01;
const TEXT_CODE: u8 = 0x02;
const NESTED_CODE: u8 = 0x05;
const INT_ZERO_CODE: u8 = 0x14;
const FLOAT_CODE: u8 = 0x21;
const FALSE_CODE: u8 = 0x26;
const TRUE_CODE: u8 = 0x27;

// Embedded 0x00 bytes in strings are escaped as 0x00 0xff so that the
// 0x00 terminator stays unambiguous and shorter strings sort first.
const ESCAPE: u8 = 0xff;

/// One element of a row-key tuple.
#[derive(Debug, Clone)]
pub enum Element {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Tuple(Vec<Element>),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl Element {
    fn type_rank(&self) -> u8 {
        match self {
            Element::Null => 0,
            Element::Bytes(_) => 1,
            Element::Text(_) => 2,
            Element::Tuple(_) => 3,
            Element::Int(_) | Element::UInt(_) => 4,
            Element::Float(_) => 5,
            Element::Bool(_) => 6,
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Element {}

impl PartialOrd for Element {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Element {
    fn cmp(&self, other: &Self) -> Ordering {
        use Element::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Tuple(a), Tuple(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (UInt(a), UInt(b)) => a.cmp(b),
            (Int(a), UInt(b)) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (UInt(_), Int(_)) => other.cmp(self).reverse(),
            (Float(a), Float(b)) => float_key(*a).cmp(&float_key(*b)),
            (Bool(a), Bool(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl From<i64> for Element {
    fn from(v: i64) -> Self {
        Element::Int(v)
    }
}

impl From<u64> for Element {
    fn from(v: u64) -> Self {
        Element::UInt(v)
    }
}

impl From<f64> for Element {
    fn from(v: f64) -> Self {
        Element::Float(v)
    }
}

impl From<bool> for Element {
    fn from(v: bool) -> Self {
        Element::Bool(v)
    }
}

impl From<&str> for Element {
    fn from(v: &str) -> Self {
        Element::Text(v.to_owned())
    }
}

impl From<String> for Element {
    fn from(v: String) -> Self {
        Element::Text(v)
    }
}

impl From<Vec<u8>> for Element {
    fn from(v: Vec<u8>) -> Self {
        Element::Bytes(v)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("tuple encoding truncated")]
    Truncated,
    #[error("invalid type code {code:#04x} at offset {offset}")]
    InvalidCode { code: u8, offset: usize },
    #[error("invalid utf-8 in encoded text element")]
    InvalidText,
}

/// Serializes a tuple so that bytewise comparison of the result matches
/// elementwise comparison of the input.
pub fn encode_tuple(elements: &[Element]) -> Vec<u8> {
    let mut out = Vec::new();
    for element in elements {
        encode_element(element, &mut out, false);
    }
    out
}

fn encode_element(element: &Element, out: &mut Vec<u8>, nested: bool) {
    match element {
        Element::Null => {
            out.push(NULL_CODE);
            // Within a nested tuple a bare 0x00 would read as the tuple
            // terminator, so nulls there get the escape continuation too.
            if nested {
                out.push(ESCAPE);
            }
        }
        Element::Bytes(bytes) => {
            out.push(BYTES_CODE);
            encode_escaped(bytes, out);
        }
        Element::Text(text) => {
            out.push(TEXT_CODE);
            encode_escaped(text.as_bytes(), out);
        }
        Element::Tuple(elements) => {
            out.push(NESTED_CODE);
            for element in elements {
                encode_element(element, out, true);
            }
            out.push(NULL_CODE);
        }
        Element::Int(value) => {
            if *value < 0 {
                encode_negative_int(value.unsigned_abs(), out);
            } else {
                encode_positive_int(*value as u64, out);
            }
        }
        Element::UInt(value) => encode_positive_int(*value, out),
        Element::Float(value) => {
            out.push(FLOAT_CODE);
            out.extend_from_slice(&float_key(*value).to_be_bytes());
        }
        Element::Bool(value) => out.push(if *value { TRUE_CODE } else { FALSE_CODE }),
    }
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        out.push(byte);
        if byte == NULL_CODE {
            out.push(ESCAPE);
        }
    }
    out.push(NULL_CODE);
}

fn magnitude_len(magnitude: u64) -> usize {
    (8 - magnitude.leading_zeros() as usize / 8).max(1)
}

fn encode_positive_int(magnitude: u64, out: &mut Vec<u8>) {
    if magnitude == 0 {
        out.push(INT_ZERO_CODE);
        return;
    }
    let len = magnitude_len(magnitude);
    out.push(INT_ZERO_CODE + len as u8);
    out.extend_from_slice(&magnitude.to_be_bytes()[8 - len..]);
}

fn encode_negative_int(magnitude: u64, out: &mut Vec<u8>) {
    // Negative values store the offset below the largest magnitude of
    // their width, so that more-negative values compare smaller.
    let len = magnitude_len(magnitude);
    out.push(INT_ZERO_CODE - len as u8);
    let max = if len == 8 { u64::MAX } else { (1u64 << (8 * len)) - 1 };
    out.extend_from_slice(&(max - magnitude).to_be_bytes()[8 - len..]);
}

/// Maps an f64 onto a u64 whose unsigned ordering is the IEEE-754 total
/// order of the original value.
fn float_key(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

fn float_from_key(key: u64) -> f64 {
    if key >> 63 == 1 {
        f64::from_bits(key ^ (1 << 63))
    } else {
        f64::from_bits(!key)
    }
}

/// Inverse of [`encode_tuple`]. Integers decode as [`Element::Int`]
/// whenever the value fits, and as [`Element::UInt`] otherwise; the two
/// compare equal to each other at equal values, so decoding a tuple
/// always yields an element-wise equal tuple.
pub fn decode_tuple(mut input: &[u8]) -> Result<Vec<Element>, DecodeError> {
    let full_len = input.len();
    let mut elements = Vec::new();
    while !input.is_empty() {
        let offset = full_len - input.len();
        let (element, rest) = decode_element(input, offset, false)?;
        elements.push(element);
        input = rest;
    }
    Ok(elements)
}

fn decode_element(
    input: &[u8],
    offset: usize,
    nested: bool,
) -> Result<(Element, &[u8]), DecodeError> {
    let (&code, rest) = input.split_first().ok_or(DecodeError::Truncated)?;
    match code {
        NULL_CODE => {
            if nested {
                match rest.split_first() {
                    Some((&ESCAPE, rest)) => Ok((Element::Null, rest)),
                    _ => Err(DecodeError::Truncated),
                }
            } else {
                Ok((Element::Null, rest))
            }
        }
        BYTES_CODE => {
            let (bytes, rest) = decode_escaped(rest)?;
            Ok((Element::Bytes(bytes), rest))
        }
        TEXT_CODE => {
            let (bytes, rest) = decode_escaped(rest)?;
            let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidText)?;
            Ok((Element::Text(text), rest))
        }
        NESTED_CODE => {
            let mut elements = Vec::new();
            let mut rest = rest;
            loop {
                match rest.first() {
                    None => return Err(DecodeError::Truncated),
                    // A bare terminator ends the tuple; 0x00 0xff is an
                    // escaped null element and is consumed below.
                    Some(&NULL_CODE) if rest.get(1) != Some(&ESCAPE) => {
                        return Ok((Element::Tuple(elements), &rest[1..]));
                    }
                    Some(_) => {
                        let inner_offset = offset + input.len() - rest.len();
                        let (element, remaining) = decode_element(rest, inner_offset, true)?;
                        elements.push(element);
                        rest = remaining;
                    }
                }
            }
        }
        FLOAT_CODE => {
            if rest.len() < 8 {
                return Err(DecodeError::Truncated);
            }
            let key = u64::from_be_bytes(rest[..8].try_into().unwrap());
            Ok((Element::Float(float_from_key(key)), &rest[8..]))
        }
        FALSE_CODE => Ok((Element::Bool(false), rest)),
        TRUE_CODE => Ok((Element::Bool(true), rest)),
        code if (INT_ZERO_CODE - 8..=INT_ZERO_CODE + 8).contains(&code) => {
            if code == INT_ZERO_CODE {
                return Ok((Element::Int(0), rest));
            }
            let positive = code > INT_ZERO_CODE;
            let len = code.abs_diff(INT_ZERO_CODE) as usize;
            if rest.len() < len {
                return Err(DecodeError::Truncated);
            }
            let mut buf = [0u8; 8];
            buf[8 - len..].copy_from_slice(&rest[..len]);
            let raw = u64::from_be_bytes(buf);
            let element = if positive {
                if raw <= i64::MAX as u64 {
                    Element::Int(raw as i64)
                } else {
                    Element::UInt(raw)
                }
            } else {
                let max = if len == 8 { u64::MAX } else { (1u64 << (8 * len)) - 1 };
                let magnitude = max - raw;
                Element::Int((magnitude as i64).wrapping_neg())
            };
            Ok((element, &rest[len..]))
        }
        code => Err(DecodeError::InvalidCode { code, offset }),
    }
}

fn decode_escaped(mut input: &[u8]) -> Result<(Vec<u8>, &[u8]), DecodeError> {
    let mut out = Vec::new();
    loop {
        match input.split_first() {
            None => return Err(DecodeError::Truncated),
            Some((&NULL_CODE, rest)) => match rest.split_first() {
                Some((&ESCAPE, rest)) => {
                    out.push(NULL_CODE);
                    input = rest;
                }
                _ => return Ok((out, rest)),
            },
            Some((&byte, rest)) => {
                out.push(byte);
                input = rest;
            }
        }
    }
}
