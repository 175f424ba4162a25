use std::num::ParseIntError;

// Parses hex address, the 0x prefix is optional
pub fn parse_address(s: &str) -> Result<u64, ParseIntError> {
    let s = s.trim_start_matches("0x");
    u64::from_str_radix(s, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_prefix() {
        assert_eq!(parse_address("0x00400000"), Ok(0x0040_0000));
        assert_eq!(parse_address("7ffd1234"), Ok(0x7ffd_1234));
        assert!(parse_address("0xzz").is_err());
    }
}
