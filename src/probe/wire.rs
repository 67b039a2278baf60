//! Byte layouts shared with the kernel probe.
//!
//! Pages and notifications cross the kernel/userspace boundary as raw byte
//! buffers; this module gives those buffers an explicit layout instead of
//! reinterpreting struct memory. All fields are native-endian because
//! producer and consumer always share the host. Buffer lengths are checked
//! once per record, then fixed-width reads use unchecked unaligned loads.

use thiserror::Error;

use super::{Notification, Page, PAGE_SIZE};
use crate::transaction::{ConnTuple, IpFamily, Method, Transaction};

/// Notification record size: `{cpu: u32, _pad: [u8; 4], idx: u64}`.
pub const NOTIFICATION_SIZE: usize = 16;

/// Page header size: `{idx: u64, pos: u8, _pad: [u8; 7]}`.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Captured request-fragment length inside a transaction record.
pub const FRAGMENT_SIZE: usize = 160;

/// One transaction record:
///
/// ```text
/// offset  field
///      0  src_ip_high: u64
///      8  src_ip_low: u64
///     16  dst_ip_high: u64
///     24  dst_ip_low: u64
///     32  src_port: u16
///     34  dst_port: u16
///     36  family: u8 (bit 0: 0 = IPv4, 1 = IPv6)
///     37  method: u8
///     38  status_code: u16
///     40  request_started: u64
///     48  response_last_seen: u64
///     56  request_fragment: [u8; 160]
///    216  owner_src_port: u16
///    218  _pad: [u8; 2]
///    220  tcp_seq: u32
///    224  static_tags: u64
/// ```
pub const TX_RECORD_SIZE: usize = 232;

/// Full page size: header plus `PAGE_SIZE` transaction records.
pub const PAGE_BYTES: usize = PAGE_HEADER_SIZE + PAGE_SIZE * TX_RECORD_SIZE;

/// Errors that can occur while decoding kernel-produced buffers.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("notification too short: {size} bytes")]
    NotificationTruncated { size: usize },

    #[error("page too short: {size} bytes")]
    PageTruncated { size: usize },

    #[error("page pos out of range: {pos}")]
    PosOutOfRange { pos: u8 },
}

/// Decode a notification record.
pub fn parse_notification(data: &[u8]) -> Result<Notification, WireError> {
    if data.len() < NOTIFICATION_SIZE {
        return Err(WireError::NotificationTruncated { size: data.len() });
    }

    Ok(Notification {
        cpu: read_u32_ne(data, 0),
        idx: read_u64_ne(data, 8),
    })
}

/// Decode a full page copy: header plus all `PAGE_SIZE` transaction slots.
///
/// Every slot is decoded, including the stale ones past `pos` — the consumer
/// slices by cursor position, not this layer.
pub fn parse_page(data: &[u8]) -> Result<Page, WireError> {
    if data.len() < PAGE_BYTES {
        return Err(WireError::PageTruncated { size: data.len() });
    }

    let pos = read_u8(data, 8);
    if usize::from(pos) > PAGE_SIZE {
        return Err(WireError::PosOutOfRange { pos });
    }

    let mut txs = Vec::with_capacity(PAGE_SIZE);
    for slot in 0..PAGE_SIZE {
        let off = PAGE_HEADER_SIZE + slot * TX_RECORD_SIZE;
        // Safety: the length check at function entry covers every record.
        let record = unsafe { data.get_unchecked(off..off + TX_RECORD_SIZE) };
        txs.push(parse_transaction(record));
    }

    Ok(Page {
        idx: read_u64_ne(data, 0),
        pos,
        txs,
    })
}

/// Decode one `TX_RECORD_SIZE`-byte transaction record.
///
/// Infallible by construction: the method byte decodes unknown values to
/// `Method::Unknown` (rejected downstream, not here) and the family field is
/// a single bit.
pub(crate) fn parse_transaction(data: &[u8]) -> Transaction {
    debug_assert!(data.len() >= TX_RECORD_SIZE);

    let family = if read_u8(data, 36) & 1 == 1 {
        IpFamily::V6
    } else {
        IpFamily::V4
    };

    let fragment = &data[56..56 + FRAGMENT_SIZE];
    let frag_len = fragment
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(FRAGMENT_SIZE);

    Transaction {
        tuple: ConnTuple {
            src_ip_high: read_u64_ne(data, 0),
            src_ip_low: read_u64_ne(data, 8),
            dst_ip_high: read_u64_ne(data, 16),
            dst_ip_low: read_u64_ne(data, 24),
            src_port: read_u16_ne(data, 32),
            dst_port: read_u16_ne(data, 34),
            family,
        },
        method: Method::from_u8(read_u8(data, 37)),
        status_code: read_u16_ne(data, 38),
        request_started: read_u64_ne(data, 40),
        response_last_seen: read_u64_ne(data, 48),
        request_fragment: fragment[..frag_len].to_vec(),
        owner_src_port: read_u16_ne(data, 216),
        tcp_seq: read_u32_ne(data, 220),
        static_tags: read_u64_ne(data, 224),
        dynamic_tags: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify buffer lengths before reading fixed offsets.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u16_ne(data: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_ne(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_ne(data: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via upfront checks.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}
