//! Internet checksum (RFC 1071) for IPv4 and UDP headers.

use std::net::Ipv4Addr;

const IPPROTO_UDP: u8 = 17;

/// Sum all 16-bit big-endian words of `data` into a 32-bit accumulator.
///
/// An odd trailing byte is treated as the high byte of a zero-padded word.
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold carries above bit 16 back into the low 16 bits.
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// One's-complement checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

/// UDP checksum over the IPv4 pseudo-header and the full UDP segment.
///
/// The checksum field inside `segment` must be zeroed by the caller when
/// computing a fresh value. A computed zero is returned as `0xFFFF`, since
/// zero on the wire means "no checksum".
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    match udp_residual(src, dst, segment) {
        0 => 0xFFFF,
        checksum => checksum,
    }
}

/// Returns the one's-complement residual of an IPv4 header; zero when valid.
pub fn ipv4_header_residual(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// Returns the residual of a UDP segment including its checksum; zero when valid.
pub fn udp_residual(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    // src, dst, zero, protocol, UDP length
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IPPROTO_UDP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    !fold(sum_words(segment, sum_words(&pseudo, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_rfc1071_example() {
        // RFC 1071 section 3 example words: 0001 f203 f4f5 f6f7
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];

        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn odd_length_is_zero_padded() {
        assert_eq!(internet_checksum(&[0xab]), internet_checksum(&[0xab, 0x00]));
    }

    #[test]
    fn empty_input_checksums_to_all_ones() {
        assert_eq!(internet_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn ipv4_header_with_its_checksum_has_zero_residual() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let checksum = internet_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());

        assert_eq!(checksum, 0xb861);
        assert_eq!(ipv4_header_residual(&header), 0);
    }

    #[test]
    fn udp_segment_with_its_checksum_has_zero_residual() {
        let src = Ipv4Addr::new(10, 0, 0, 6);
        let dst = Ipv4Addr::new(8, 8, 8, 8);
        let mut segment = vec![0xfb, 0xd3, 0x00, 0x35, 0x00, 0x0d, 0x00, 0x00, 1, 2, 3, 4, 5];
        let checksum = udp_checksum(src, dst, &segment);
        segment[6..8].copy_from_slice(&checksum.to_be_bytes());

        assert_eq!(udp_residual(src, dst, &segment), 0);
    }
}
