//! CHAP authentication (algorithm 5, MD5)
//!
//! The response is `MD5(identifier_byte || secret_ascii || challenge_bytes)`
//! formatted as `0x` plus lowercase hex.

use vdisk_core::{Error, Result};

/// The only CHAP algorithm iSCSI defines as mandatory
pub const CHAP_ALGORITHM_MD5: u32 = 5;

/// Compute the `CHAP_R` value for a challenge
pub fn chap_response(identifier: u8, secret: &str, challenge: &[u8]) -> String {
    let mut input = Vec::with_capacity(1 + secret.len() + challenge.len());
    input.push(identifier);
    input.extend_from_slice(secret.as_bytes());
    input.extend_from_slice(challenge);
    let digest = md5::compute(&input);
    format!("0x{}", hex::encode(digest.0))
}

/// Parse a `0x…`-formatted large-binary value such as `CHAP_C`
pub fn parse_hex_value(text: &str) -> Result<Vec<u8>> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| Error::protocol(format!("binary value '{}' lacks 0x prefix", text)))?;
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(Error::protocol(format!(
            "binary value '{}' has an odd or empty digit string",
            text
        )));
    }
    hex::decode(digits).map_err(|_| Error::protocol(format!("binary value '{}' is not hex", text)))
}

/// Parse the `CHAP_I` identifier byte
pub fn parse_identifier(text: &str) -> Result<u8> {
    text.parse::<u8>()
        .map_err(|_| Error::protocol(format!("CHAP identifier '{}' is not a byte", text)))
}
