use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

/// Largest payload carried in a single outbound segment. Outbound data is
/// chunked to this size; it is chosen so a full segment fits a typical
/// Ethernet frame after IP and TCP headers.
pub const MAX_SEGMENT_SIZE: usize = 1460;

/// Length of the fixed header. Headers this crate emits carry no options, so
/// their data offset is always `HEADER_LEN / 4`.
pub const HEADER_LEN: usize = 20;

/// Window size advertised on every outbound segment. The receive window is
/// not enforced, so this is a placeholder value sized for a handful of full
/// segments in flight.
pub const DEFAULT_WINDOW: u16 = 8 * MAX_SEGMENT_SIZE as u16;

bitflags! {
    /// TCP header flags, in the low bits of the offset/flags word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SegmentFlags: u16 {
        const FIN = 1;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
    }
}

/// The fixed TCP header.
///
/// [SegmentHeader::ser] and [SegmentHeader::try_parse] are inverse except for
/// bits with no meaning here: reserved bits and unsupported flags are dropped
/// on parse. The checksum field is serialized as-is; building a correctly
/// checksummed segment is [crate::checksum]'s job since it needs the full
/// datagram and the IP pseudo-header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_no: u32,
    pub ack_no: u32,
    /// header length in 4-byte units, 5 for the option-less headers built here
    pub data_offset: u8,
    pub flags: SegmentFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl SegmentHeader {
    pub fn new(src_port: u16, dst_port: u16, seq_no: u32, ack_no: u32, flags: SegmentFlags) -> SegmentHeader {
        SegmentHeader {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            data_offset: (HEADER_LEN / 4) as u8,
            flags,
            window_size: DEFAULT_WINDOW,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq_no);
        buf.put_u32(self.ack_no);
        buf.put_u16(((self.data_offset as u16) << 12) | self.flags.bits());
        buf.put_u16(self.window_size);
        buf.put_u16(self.checksum);
        buf.put_u16(self.urgent_ptr);
    }

    pub fn try_parse(buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        if buf.remaining() < HEADER_LEN {
            bail!(
                "datagram of {} bytes is shorter than the fixed header",
                buf.remaining()
            );
        }

        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let seq_no = buf.get_u32();
        let ack_no = buf.get_u32();
        let offset_and_flags = buf.get_u16();
        let window_size = buf.get_u16();
        let checksum = buf.get_u16();
        let urgent_ptr = buf.get_u16();

        Ok(SegmentHeader {
            src_port,
            dst_port,
            seq_no,
            ack_no,
            data_offset: (offset_and_flags >> 12) as u8,
            flags: SegmentFlags::from_bits_truncate(offset_and_flags & 0x0fff),
            window_size,
            checksum,
            urgent_ptr,
        })
    }

    /// Header length in bytes as claimed by the data offset field.
    pub fn header_len(&self) -> usize {
        4 * self.data_offset as usize
    }

    /// The payload of the datagram this header was parsed from, skipping any
    /// options. Fails if the data offset points into the fixed header or past
    /// the end of the datagram.
    pub fn payload<'a>(&self, datagram: &'a [u8]) -> anyhow::Result<&'a [u8]> {
        let header_len = self.header_len();
        if header_len < HEADER_LEN || header_len > datagram.len() {
            bail!(
                "data offset {} is invalid for a datagram of {} bytes",
                self.data_offset,
                datagram.len()
            );
        }
        Ok(&datagram[header_len..])
    }
}
