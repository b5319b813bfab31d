use openvote_core::Digest;

pub fn parse_hex_32(s: &str) -> Result<[u8; 32], String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| format!("Invalid hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("Expected 32 bytes, got {}", bytes.len()));
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    Ok(array)
}

pub fn parse_digest(s: &str) -> Result<Digest, String> {
    parse_hex_32(s).map(Digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_32() {
        let hex = "08".repeat(32);
        assert_eq!(parse_hex_32(&hex).unwrap(), [8u8; 32]);
        assert_eq!(parse_hex_32(&format!("0x{}", hex)).unwrap(), [8u8; 32]);
        assert!(parse_hex_32("abcd").is_err());
        assert!(parse_hex_32(&"zz".repeat(32)).is_err());
    }
}
