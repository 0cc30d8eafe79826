use ethers::types::{Address, U256};
use ethers::utils::to_checksum;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    #[error("Invalid amount {input:?}: {details}")]
    InvalidAmount { input: String, details: String },

    #[error("Invalid address {input:?}: {details}")]
    InvalidAddress { input: String, details: String },
}

impl ParserError {
    fn amount(input: &str, details: impl Into<String>) -> Self {
        Self::InvalidAmount {
            input: input.to_string(),
            details: details.into(),
        }
    }

    fn address(input: &str, details: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.to_string(),
            details: details.into(),
        }
    }
}

/// Parse a human decimal string (e.g. `"15.99"`) into a fixed-point token
/// amount with `decimals` fractional digits.
///
/// Only strictly positive amounts are accepted. Signs, exponents, separators
/// and more fractional digits than the token supports are all rejected rather
/// than rounded. `ethers::utils::parse_units` is not used here because it
/// truncates silently: `"1.0000001"` at 6 decimals becomes `1000000`.
pub fn parse_amount(input: &str, decimals: u8) -> Result<U256, ParserError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParserError::amount(input, "amount is empty"));
    }
    if trimmed.starts_with('-') {
        return Err(ParserError::amount(input, "amount must be positive"));
    }

    let (whole, frac) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(ParserError::amount(input, "amount has no digits"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParserError::amount(input, "amount must be a plain decimal number"));
    }
    if frac.len() > decimals as usize {
        return Err(ParserError::amount(
            input,
            format!("more than {} fractional digits", decimals),
        ));
    }

    let mut digits = String::with_capacity(whole.len() + decimals as usize);
    digits.push_str(whole);
    digits.push_str(frac);
    digits.extend(std::iter::repeat('0').take(decimals as usize - frac.len()));
    let digits = digits.trim_start_matches('0');

    let value = if digits.is_empty() {
        U256::zero()
    } else {
        U256::from_dec_str(digits)
            .map_err(|e| ParserError::amount(input, format!("out of range: {e}")))?
    };

    if value.is_zero() {
        return Err(ParserError::amount(input, "amount must be greater than zero"));
    }
    Ok(value)
}

/// Render a fixed-point amount back to a decimal string, trimming trailing
/// fractional zeros (`15990000` at 6 decimals → `"15.99"`).
pub fn format_amount(amount: U256, decimals: u8) -> String {
    let scale = U256::exp10(decimals as usize);
    let whole = amount / scale;
    let frac = amount % scale;
    if frac.is_zero() {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Validate and parse a `0x`-prefixed 20-byte hex address.
///
/// All-lowercase and all-uppercase forms are accepted as-is; mixed case must
/// carry a valid EIP-55 checksum.
pub fn parse_address(input: &str) -> Result<Address, ParserError> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ParserError::address(input, "missing 0x prefix"))?;

    if hex_part.len() != 40 {
        return Err(ParserError::address(
            input,
            format!("expected 40 hex characters, found {}", hex_part.len()),
        ));
    }

    let bytes = hex::decode(hex_part).map_err(|e| ParserError::address(input, e.to_string()))?;
    let address = Address::from_slice(&bytes);

    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        let checksummed = to_checksum(&address, None);
        if checksummed[2..] != *hex_part {
            return Err(ParserError::address(input, "bad EIP-55 checksum"));
        }
    }

    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_whole_and_fraction() {
        assert_eq!(parse_amount("1", 6).unwrap(), U256::from(1_000_000u64));
        assert_eq!(parse_amount("15.99", 6).unwrap(), U256::from(15_990_000u64));
        assert_eq!(parse_amount("0.000001", 6).unwrap(), U256::from(1u64));
        assert_eq!(parse_amount(".5", 6).unwrap(), U256::from(500_000u64));
        assert_eq!(parse_amount(" 2.50 ", 6).unwrap(), U256::from(2_500_000u64));
    }

    #[test]
    fn test_parse_amount_rejects_zero_and_negative() {
        for bad in ["0", "0.0", "0.000000", "-1", "-0.5"] {
            let err = parse_amount(bad, 6).unwrap_err();
            assert!(matches!(err, ParserError::InvalidAmount { .. }), "{bad}");
        }
    }

    #[test]
    fn test_parse_amount_rejects_excess_precision() {
        let err = parse_amount("1.0000001", 6).unwrap_err();
        assert!(err.to_string().contains("more than 6 fractional digits"));
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        for bad in ["", "   ", ".", "abc", "1e6", "1,000", "+5", "1.2.3"] {
            assert!(parse_amount(bad, 6).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(U256::from(15_990_000u64), 6), "15.99");
        assert_eq!(format_amount(U256::from(1_000_000u64), 6), "1");
        assert_eq!(format_amount(U256::from(1u64), 6), "0.000001");
        assert_eq!(format_amount(U256::zero(), 6), "0");
    }

    #[test]
    fn test_parse_address_lowercase() {
        let addr = parse_address("0xcac524bca292aaade2df8a05cc58f0a65b1b3bb9").unwrap();
        assert_eq!(
            to_checksum(&addr, None),
            "0xCaC524BcA292aaade2DF8A05cC58F0a65B1B3bB9"
        );
    }

    #[test]
    fn test_parse_address_valid_checksum() {
        assert!(parse_address("0xCaC524BcA292aaade2DF8A05cC58F0a65B1B3bB9").is_ok());
    }

    #[test]
    fn test_parse_address_bad_checksum() {
        let err = parse_address("0xCAc524BcA292aaade2DF8A05cC58F0a65B1B3bB9").unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_parse_address_rejects_malformed() {
        for bad in [
            "not-an-address",
            "",
            "0x",
            "cac524bca292aaade2df8a05cc58f0a65b1b3bb9",
            "0xcac524bca292aaade2df8a05cc58f0a65b1b3b",
            "0xzac524bca292aaade2df8a05cc58f0a65b1b3bb9",
        ] {
            assert!(
                matches!(parse_address(bad), Err(ParserError::InvalidAddress { .. })),
                "{bad:?} should be rejected"
            );
        }
    }
}
