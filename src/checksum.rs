//! RFC 1071 internet checksum over a TCP segment and its IP pseudo-header.
//!
//! The checksum is the ones' complement of the ones' complement sum of the
//! segment seen as big-endian 16-bit words, an odd trailing byte padded with
//! zero, plus the pseudo-header derived from the IP layer. A segment carrying
//! a correct checksum in its header sums to `0xffff`, so [compute] returns 0
//! for it.

use std::net::IpAddr;

/// Byte offset of the checksum field within the segment header.
pub const CHECKSUM_OFFSET: usize = 16;

const PROTO_TCP: u8 = 6;

/// Checksum of the full segment (header and payload) combined with the
/// pseudo-header for the given addresses. Returns 0 iff the checksum embedded
/// in the segment is valid for these addresses.
///
/// Panics if the two addresses are not of the same family.
pub fn compute(segment: &[u8], src_addr: IpAddr, dst_addr: IpAddr) -> u16 {
    let acc = pseudo_header_sum(src_addr, dst_addr, segment.len());
    !fold(sum_be_words(segment, acc))
}

/// Patches the checksum field of `segment` in place so that it verifies for
/// the given addresses. The previous contents of the field are overwritten.
pub fn fill(segment: &mut [u8], src_addr: IpAddr, dst_addr: IpAddr) {
    assert!(segment.len() >= CHECKSUM_OFFSET + 2);

    segment[CHECKSUM_OFFSET] = 0;
    segment[CHECKSUM_OFFSET + 1] = 0;
    let value = compute(segment, src_addr, dst_addr);
    segment[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&value.to_be_bytes());
}

fn pseudo_header_sum(src_addr: IpAddr, dst_addr: IpAddr, segment_len: usize) -> u32 {
    match (src_addr, dst_addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut acc = 0;
            acc = sum_be_words(&src.octets(), acc);
            acc = sum_be_words(&dst.octets(), acc);
            // zero byte and protocol number form one word
            acc += PROTO_TCP as u32;
            acc + segment_len as u32
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut acc = 0;
            acc = sum_be_words(&src.octets(), acc);
            acc = sum_be_words(&dst.octets(), acc);
            acc += PROTO_TCP as u32;
            acc + segment_len as u32
        }
        _ => panic!("checksum over mixed address families"),
    }
}

fn sum_be_words(data: &[u8], mut acc: u32) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        acc += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    // an odd trailing byte is padded with zero to its right
    if let Some(&last) = words.remainder().first() {
        acc += (last as u32) << 8;
    }
    acc
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
