//! Conversions between frequencies and their "natural" SI strings.

const PREFIXES: [&str; 7] = ["", "k", "M", "G", "T", "P", "E"];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("Invalid size string: '{0}'")]
pub struct ParseSizeError(pub String);

fn divisor(exponent: usize) -> u64 {
    1000u64.pow(exponent as u32)
}

/// Format `value` with the largest SI prefix that keeps the integer part
/// below 1000, dropping trailing zeros of the fraction.
pub fn si_string(value: u64, unit: &str) -> String {
    let mut exponent = 0;
    while exponent + 1 < PREFIXES.len() && value / divisor(exponent) >= 1000 {
        exponent += 1;
    }

    let quot = value / divisor(exponent);
    let mut fraction = String::new();
    if exponent > 0 {
        let rem = value % divisor(exponent);
        let digits = format!("{:0width$}", rem, width = exponent * 3);
        let digits = digits.trim_end_matches('0');
        if !digits.is_empty() {
            fraction = format!(".{digits}");
        }
    }

    format!("{quot}{fraction} {}{unit}", PREFIXES[exponent])
}

/// `3_000_000` becomes `"3 MHz"`, `31_500` becomes `"31.5 kHz"`.
///
/// ```
/// use labfeed_rs::units::samplerate_string;
///
/// assert_eq!(samplerate_string(3_000_000), "3 MHz");
/// assert_eq!(samplerate_string(31_500), "31.5 kHz");
/// assert_eq!(samplerate_string(125), "125 Hz");
/// ```
pub fn samplerate_string(samplerate: u64) -> String {
    si_string(samplerate, "Hz")
}

/// Parse a size or frequency such as `"1M"`, `"31.5 kHz"` or `"200"`.
///
/// An SI multiplier letter (case-insensitive, `k` through `E`) may follow
/// the number, optionally followed by `Hz`.
pub fn parse_size(text: &str) -> Result<u64, ParseSizeError> {
    let err = || ParseSizeError(text.to_string());
    let s = text.trim();

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (int_part, mut rest) = s.split_at(digits_end);
    let mut value: u64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|_| err())?
    };

    // Fraction kept as numerator / 10^digits so that scaling stays exact.
    let mut fraction: Option<(u128, u128)> = None;
    if let Some(after_dot) = rest.strip_prefix('.') {
        let frac_end = after_dot
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after_dot.len());
        let frac_digits = &after_dot[..frac_end.min(18)];
        if !frac_digits.is_empty() {
            let numerator: u128 = frac_digits.parse().map_err(|_| err())?;
            fraction = Some((numerator, 10u128.pow(frac_digits.len() as u32)));
        }
        rest = &after_dot[frac_end..];
    }
    if int_part.is_empty() && fraction.is_none() {
        return Err(err());
    }

    rest = rest.trim_start();
    let multiplier = match rest.chars().next() {
        Some('k' | 'K') => Some(1),
        Some('m' | 'M') => Some(2),
        Some('g' | 'G') => Some(3),
        Some('t' | 'T') => Some(4),
        Some('p' | 'P') => Some(5),
        Some('e' | 'E') => Some(6),
        _ => None,
    };
    if let Some(exponent) = multiplier {
        rest = &rest[1..];
        let scale = divisor(exponent);
        value = value.checked_mul(scale).ok_or_else(err)?;
        if let Some((numerator, denominator)) = fraction {
            let extra = u64::try_from(numerator * u128::from(scale) / denominator).map_err(|_| err())?;
            value = value.checked_add(extra).ok_or_else(err)?;
        }
    }

    let rest = rest.trim();
    if !rest.is_empty() && !rest.eq_ignore_ascii_case("hz") {
        return Err(err());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samplerate_strings() {
        assert_eq!(samplerate_string(0), "0 Hz");
        assert_eq!(samplerate_string(999), "999 Hz");
        assert_eq!(samplerate_string(1000), "1 kHz");
        assert_eq!(samplerate_string(20_000), "20 kHz");
        assert_eq!(samplerate_string(1_000_001), "1.000001 MHz");
        assert_eq!(samplerate_string(24_000_000), "24 MHz");
        assert_eq!(samplerate_string(2_500_000_000), "2.5 GHz");
    }

    #[test]
    fn test_si_string_other_units() {
        assert_eq!(si_string(4096, "B"), "4.096 kB");
        assert_eq!(si_string(12, ""), "12 ");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("200"), Ok(200));
        assert_eq!(parse_size("1M"), Ok(1_000_000));
        assert_eq!(parse_size("31.5 kHz"), Ok(31_500));
        assert_eq!(parse_size("2.5ghz"), Ok(2_500_000_000));
        assert_eq!(parse_size("125 Hz"), Ok(125));
        assert_eq!(parse_size(" 8k "), Ok(8000));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("fast").is_err());
        assert!(parse_size("10 kbit").is_err());
        assert!(parse_size("99999999999999999999E").is_err());
    }

    #[test]
    fn test_natural_strings_parse_back() {
        for rate in [1, 125, 31_500, 1_000_000, 1_000_001, 48_000, 3_125_000] {
            assert_eq!(parse_size(&samplerate_string(rate)), Ok(rate));
        }
    }
}
