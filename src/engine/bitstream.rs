//! VPU bitstream framing for MPEG-2 input

use bytes::BufMut;

/// Marks the start of a framed slice ("RKVB" little-endian).
pub const START_CODE: u32 = 0x4256_4b52;

/// Length of the header placed in front of every MPEG-2 payload.
pub const HEADER_LEN: usize = 32;

/// Write the slice header for a `payload_len` byte slice stamped `timestamp_us`.
pub fn put_header(buf: &mut impl BufMut, payload_len: usize, timestamp_us: i64) {
    buf.put_u32_le(START_CODE);
    buf.put_u32_le(payload_len as u32);
    // slice time in milliseconds, low word only
    buf.put_u32_le((timestamp_us / 1000) as u32);
    buf.put_u32_le(0);
    buf.put_u32_le(0); // slice type
    buf.put_u32_le(0); // slice number
    buf.put_u64_le(0); // reserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BytesMut};

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, 1234, 2_500_000);
        assert_eq!(buf.len(), HEADER_LEN);

        let mut header = buf.freeze();
        assert_eq!(header.get_u32_le(), START_CODE);
        assert_eq!(header.get_u32_le(), 1234);
        assert_eq!(header.get_u32_le(), 2500);
        assert!(header.iter().all(|b| *b == 0));
    }
}
