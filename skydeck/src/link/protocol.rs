//! Simulator UDP protocol.
//!
//! # Wire Format
//!
//! All integers and floats are little-endian.
//!
//! | Datagram  | Direction       | Layout |
//! |-----------|-----------------|--------|
//! | Subscribe | link -> sim     | `"RREF\0"[5] freq:i32 index:i32 data_ref:char[400]` (413 bytes) |
//! | Command   | link -> sim     | `"CMND\0"[5] command:bytes 0x00` |
//! | Values    | sim -> link     | `"RREF,"[5]` then N x `index:i32 value:f32` |
//!
//! The data reference is NUL-terminated inside a zero-filled 400-byte field,
//! so at most 399 bytes of name fit. A subscribe with `freq = 0` cancels the
//! subscription at that index. In a values datagram
//! `N = (len - 5) / 8`; trailing bytes that do not form a full record are
//! ignored.

use std::fmt;
use std::iter::FusedIterator;
use std::slice::ChunksExact;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag opening a subscribe request.
pub const SUBSCRIBE_TAG: &[u8; 5] = b"RREF\0";
/// Tag opening a command request.
pub const COMMAND_TAG: &[u8; 5] = b"CMND\0";
/// Header of every inbound values datagram.
pub const VALUES_HEADER: &[u8; 5] = b"RREF,";

/// Width of the zero-filled data reference field in a subscribe request.
pub const DATA_REF_FIELD_LEN: usize = 400;
/// Longest data reference that still leaves room for its terminator.
pub const MAX_DATA_REF_LEN: usize = DATA_REF_FIELD_LEN - 1;
/// Exact size of an encoded subscribe request.
pub const SUBSCRIBE_REQUEST_LEN: usize = SUBSCRIBE_TAG.len() + 4 + 4 + DATA_REF_FIELD_LEN;
/// Size of one `(index, value)` record in a values datagram.
pub const VALUE_RECORD_LEN: usize = 8;

/// Position of a subscription in the link's table, echoed by the simulator
/// in every value record.
///
/// Invariant: fits in a non-negative `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionIndex(u32);

impl SubscriptionIndex {
    /// Largest index representable on the wire.
    pub const MAX: Self = Self(i32::MAX as u32);

    /// Returns `None` above [`SubscriptionIndex::MAX`].
    #[must_use]
    pub const fn new(index: u32) -> Option<Self> {
        if index <= Self::MAX.0 {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Interprets a wire index. Negative values have no subscription.
    #[must_use]
    pub const fn from_wire(index: i32) -> Option<Self> {
        if index < 0 { None } else { Some(Self(index as u32)) }
    }

    #[must_use]
    pub const fn to_wire(self) -> i32 {
        self.0 as i32
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubscriptionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery rate in Hz. Zero means "unsubscribe".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frequency(u16);

impl Frequency {
    /// Cancels a subscription when sent.
    pub const UNSUBSCRIBE: Self = Self(0);

    #[must_use]
    pub const fn new(hz: u16) -> Self {
        Self(hz)
    }

    #[must_use]
    pub const fn hz(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Interprets a wire frequency. Values outside `0..=u16::MAX` are rejected.
    #[must_use]
    pub fn from_wire(hz: i32) -> Option<Self> {
        u16::try_from(hz).ok().map(Self)
    }

    #[must_use]
    pub const fn to_wire(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.0)
    }
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Start (or, with [`Frequency::UNSUBSCRIBE`], stop) value delivery.
    Subscribe {
        frequency: Frequency,
        index: SubscriptionIndex,
        data_ref: String,
    },
    /// Trigger a named simulator command once.
    Command(String),
}

/// One `(index, value)` pair from a values datagram.
///
/// The index is kept raw; bounds are the subscription table's business.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRecord {
    pub index: i32,
    pub value: f32,
}

/// Protocol encoding/decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Datagram ends before a required field.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// Request has a fixed size and this one isn't it.
    #[error("invalid request length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    /// Inbound datagram doesn't start with `"RREF,"`.
    #[error("unexpected datagram header")]
    UnexpectedHeader,
    /// Request tag is neither `RREF\0` nor `CMND\0`.
    #[error("unknown request tag: {0:?}")]
    UnknownTag([u8; 5]),
    /// Data reference doesn't fit the 400-byte field with its terminator.
    #[error("data reference is {len} bytes, at most {max} fit")]
    DataRefTooLong { len: usize, max: usize },
    /// Names are NUL-terminated on the wire.
    #[error("name contains an interior NUL byte")]
    InteriorNul,
    /// Name field has no NUL terminator.
    #[error("name is not NUL-terminated")]
    Unterminated,
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid frequency: {0}")]
    InvalidFrequency(i32),
    #[error("negative subscription index: {0}")]
    NegativeIndex(i32),
}

/// Checks that `data_ref` can be encoded into a subscribe request.
///
/// # Errors
///
/// [`ProtocolError::DataRefTooLong`] or [`ProtocolError::InteriorNul`].
pub fn validate_data_ref(data_ref: &str) -> Result<(), ProtocolError> {
    if data_ref.len() > MAX_DATA_REF_LEN {
        return Err(ProtocolError::DataRefTooLong {
            len: data_ref.len(),
            max: MAX_DATA_REF_LEN,
        });
    }
    if data_ref.as_bytes().contains(&0) {
        return Err(ProtocolError::InteriorNul);
    }
    Ok(())
}

/// Encodes a subscribe request into `buf` (cleared first).
///
/// # Errors
///
/// Returns an error if `data_ref` fails [`validate_data_ref`]; `buf` is left
/// empty in that case.
pub fn encode_subscribe(
    frequency: Frequency,
    index: SubscriptionIndex,
    data_ref: &str,
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    buf.clear();
    validate_data_ref(data_ref)?;

    let mut w = DatagramWriter::new(buf);
    w.put_bytes(SUBSCRIBE_TAG);
    w.put_i32(frequency.to_wire());
    w.put_i32(index.to_wire());
    w.put_bytes(data_ref.as_bytes());
    w.put_zeros(DATA_REF_FIELD_LEN - data_ref.len());
    debug_assert_eq!(buf.len(), SUBSCRIBE_REQUEST_LEN);
    Ok(())
}

/// Encodes a command request into `buf` (cleared first).
///
/// # Errors
///
/// Returns [`ProtocolError::InteriorNul`] if `command` contains a NUL byte.
pub fn encode_command(command: &str, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    buf.clear();
    if command.as_bytes().contains(&0) {
        return Err(ProtocolError::InteriorNul);
    }

    let mut w = DatagramWriter::new(buf);
    w.put_bytes(COMMAND_TAG);
    w.put_bytes(command.as_bytes());
    w.put_zeros(1);
    Ok(())
}

/// Encodes any outbound request into `buf`.
///
/// # Errors
///
/// See [`encode_subscribe`] and [`encode_command`].
pub fn encode_request(request: &Request, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match request {
        Request::Subscribe {
            frequency,
            index,
            data_ref,
        } => encode_subscribe(*frequency, *index, data_ref, buf),
        Request::Command(command) => encode_command(command, buf),
    }
}

/// Decodes an outbound request. This is the simulator's side of the
/// exchange, used by fake simulators and diagnostics.
///
/// # Errors
///
/// Returns an error on an unknown tag, wrong size, bad name or out-of-range
/// field.
pub fn decode_request(buf: &[u8]) -> Result<Request, ProtocolError> {
    let mut r = DatagramReader::new(buf);
    let tag = r.take_array::<5>()?;
    match &tag {
        SUBSCRIBE_TAG => {
            if buf.len() != SUBSCRIBE_REQUEST_LEN {
                return Err(ProtocolError::InvalidLength {
                    expected: SUBSCRIBE_REQUEST_LEN,
                    actual: buf.len(),
                });
            }
            let raw_frequency = r.take_i32()?;
            let frequency = Frequency::from_wire(raw_frequency)
                .ok_or(ProtocolError::InvalidFrequency(raw_frequency))?;
            let raw_index = r.take_i32()?;
            let index = SubscriptionIndex::from_wire(raw_index)
                .ok_or(ProtocolError::NegativeIndex(raw_index))?;
            let data_ref = take_c_string(r.take_bytes(DATA_REF_FIELD_LEN)?)?;
            Ok(Request::Subscribe {
                frequency,
                index,
                data_ref,
            })
        }
        COMMAND_TAG => {
            let body = r.take_rest();
            let command = take_c_string(body)?;
            // Exactly one terminator, at the very end.
            if command.len() + 1 != body.len() {
                return Err(ProtocolError::InteriorNul);
            }
            Ok(Request::Command(command))
        }
        _ => Err(ProtocolError::UnknownTag(tag)),
    }
}

/// Splits a values datagram into its records.
///
/// # Errors
///
/// [`ProtocolError::BufferTooSmall`] below 5 bytes,
/// [`ProtocolError::UnexpectedHeader`] when the header isn't `"RREF,"`.
pub fn decode_values(buf: &[u8]) -> Result<ValueRecords<'_>, ProtocolError> {
    let mut r = DatagramReader::new(buf);
    if r.take_array::<5>()? != *VALUES_HEADER {
        return Err(ProtocolError::UnexpectedHeader);
    }
    Ok(ValueRecords {
        chunks: r.take_rest().chunks_exact(VALUE_RECORD_LEN),
    })
}

/// Encodes a values datagram into `buf` (cleared first).
pub fn encode_values(records: impl IntoIterator<Item = ValueRecord>, buf: &mut Vec<u8>) {
    let mut w = DatagramWriter::new(buf);
    w.put_bytes(VALUES_HEADER);
    for record in records {
        w.put_i32(record.index);
        w.put_f32(record.value);
    }
}

/// Iterator over the records of a values datagram.
#[derive(Debug, Clone)]
pub struct ValueRecords<'a> {
    chunks: ChunksExact<'a, u8>,
}

impl ValueRecords<'_> {
    /// Bytes after the last whole record.
    #[must_use]
    pub fn remainder_len(&self) -> usize {
        self.chunks.remainder().len()
    }
}

impl Iterator for ValueRecords<'_> {
    type Item = ValueRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let (index, value) = chunk.split_at(4);
        Some(ValueRecord {
            index: i32::from_le_bytes(index.try_into().ok()?),
            value: f32::from_le_bytes(value.try_into().ok()?),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for ValueRecords<'_> {}
impl FusedIterator for ValueRecords<'_> {}

fn take_c_string(field: &[u8]) -> Result<String, ProtocolError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Unterminated)?;
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

struct DatagramWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> DatagramWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }
}

struct DatagramReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> DatagramReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.cursor + n;
        if end > self.buf.len() {
            return Err(ProtocolError::BufferTooSmall {
                need: end,
                have: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.cursor..end];
        self.cursor = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take_bytes(N)?);
        Ok(arr)
    }

    fn take_i32(&mut self) -> Result<i32, ProtocolError> {
        self.take_array().map(i32::from_le_bytes)
    }

    fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.cursor..];
        self.cursor = self.buf.len();
        rest
    }
}
