//! Conversion between textual IPv4 CIDRs and the hex/mask form `tc filter`
//! output uses (e.g. `0a000005/ffffffff`).

use std::net::Ipv4Addr;

use crate::error::{TcError, TcResult};

/// Parses a textual IPv4 CIDR, masks the address to the network, and emits
/// 8 hex digits for the address followed by a slash and the mask's
/// dotted-quad bytes rendered as hex (`ffffffff` for `/32`).
pub fn to_hex(cidr: &str) -> TcResult<String> {
    let (addr, prefix) = split_cidr(cidr)?;

    let mask = prefix_to_mask(prefix).ok_or_else(|| TcError::BadCidr(cidr.to_string()))?;
    let masked = u32::from(addr) & mask;

    Ok(format!("{:08x}/{:08x}", masked, mask))
}

/// Inverse of [`to_hex`]. Fails with [`TcError::BadCidr`] when the piece
/// count isn't two or the decoded bytes can't form an IPv4 address.
pub fn to_ascii(hex_form: &str) -> TcResult<String> {
    let parts: Vec<&str> = hex_form.split('/').collect();
    if parts.len() != 2 {
        return Err(TcError::BadCidr(hex_form.to_string()));
    }

    let addr_bits = u32::from_str_radix(parts[0], 16).map_err(|_| TcError::BadCidr(hex_form.to_string()))?;
    let mask_bits = u32::from_str_radix(parts[1], 16).map_err(|_| TcError::BadCidr(hex_form.to_string()))?;

    let addr = Ipv4Addr::from(addr_bits);
    let prefix = mask_to_prefix(mask_bits).ok_or_else(|| TcError::BadCidr(hex_form.to_string()))?;

    Ok(format!("{addr}/{prefix}"))
}

fn split_cidr(cidr: &str) -> TcResult<(Ipv4Addr, u8)> {
    let (addr_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| TcError::BadCidr(cidr.to_string()))?;

    let addr: Ipv4Addr = addr_part.parse().map_err(|_| TcError::BadCidr(cidr.to_string()))?;
    let prefix: u8 = prefix_part.parse().map_err(|_| TcError::BadCidr(cidr.to_string()))?;
    if prefix > 32 {
        return Err(TcError::BadCidr(cidr.to_string()));
    }

    Ok((addr, prefix))
}

fn prefix_to_mask(prefix: u8) -> Option<u32> {
    if prefix > 32 {
        return None;
    }
    Some(if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) })
}

fn mask_to_prefix(mask: u32) -> Option<u8> {
    // A valid netmask is a run of 1s followed by a run of 0s.
    let ones = mask.leading_ones();
    if prefix_to_mask(ones as u8) == Some(mask) {
        Some(ones as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("10.0.0.5/32", "0a000005/ffffffff")]
    #[case("10.0.0.0/24", "0a000000/ffffff00")]
    #[case("0.0.0.0/0", "00000000/00000000")]
    #[case("192.168.1.1/16", "c0a80000/ffff0000")]
    fn to_hex_matches(#[case] cidr: &str, #[case] hex: &str) {
        assert_eq!(to_hex(cidr).unwrap(), hex);
    }

    #[test]
    fn to_hex_masks_host_bits() {
        // 10.0.0.5/24 should mask to 10.0.0.0/24's network.
        assert_eq!(to_hex("10.0.0.5/24").unwrap(), "0a000000/ffffff00");
    }

    #[test]
    fn to_hex_rejects_garbage() {
        assert!(to_hex("not-a-cidr").is_err());
        assert!(to_hex("10.0.0.1/33").is_err());
        assert!(to_hex("10.0.0.1").is_err());
    }

    #[test]
    fn to_ascii_rejects_bad_piece_count() {
        assert!(to_ascii("0a000005").is_err());
        assert!(to_ascii("0a000005/ffffffff/extra").is_err());
    }

    #[test]
    fn to_ascii_rejects_non_hex() {
        assert!(to_ascii("zzzzzzzz/ffffffff").is_err());
    }

    #[rstest]
    #[case("10.0.0.5/32")]
    #[case("10.0.0.0/24")]
    #[case("192.168.100.0/22")]
    #[case("0.0.0.0/0")]
    fn round_trips(#[case] cidr: &str) {
        let hex = to_hex(cidr).unwrap();
        assert_eq!(to_ascii(&hex).unwrap(), cidr);
    }
}
