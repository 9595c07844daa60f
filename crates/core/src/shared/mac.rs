/// MAC address canonicalisation for beacon identifiers.
///
/// The canonical form is uppercase colon-separated: `XX:XX:XX:XX:XX:XX`.
/// Accepted inputs are `:`-, `-`- or whitespace-separated hex pairs and
/// the bare 12-hex-digit form.

/// Normalises a MAC address string, or returns `None` when the input does
/// not contain exactly twelve hex digits.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-') && !c.is_whitespace())
        .collect();

    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let upper = digits.to_ascii_uppercase();
    let mut out = String::with_capacity(17);
    for (i, chunk) in upper.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(':');
        }
        // chunks of a 12-byte ASCII string are valid UTF-8
        out.push(chunk[0] as char);
        out.push(chunk[1] as char);
    }
    Some(out)
}

/// True when `mac` is already in canonical form.
pub fn is_canonical_mac(mac: &str) -> bool {
    let bytes = mac.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        if i % 3 == 2 {
            if *b != b':' {
                return false;
            }
        } else if !b.is_ascii_hexdigit() || b.is_ascii_lowercase() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("aa:bb:cc:dd:ee:01", "AA:BB:CC:DD:EE:01")]
    #[case("AA-BB-CC-DD-EE-01", "AA:BB:CC:DD:EE:01")]
    #[case("aabbccddee01", "AA:BB:CC:DD:EE:01")]
    #[case("aa bb cc dd ee 01", "AA:BB:CC:DD:EE:01")]
    #[case("  AA:BB:CC:DD:EE:01  ", "AA:BB:CC:DD:EE:01")]
    fn test_normalize_accepted_forms(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_mac(input).as_deref(), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("AA:BB:CC:DD:EE")]
    #[case("AA:BB:CC:DD:EE:01:02")]
    #[case("GG:BB:CC:DD:EE:01")]
    #[case("not a mac")]
    fn test_normalize_rejects_invalid(#[case] input: &str) {
        assert_eq!(normalize_mac(input), None);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_mac("aa-bb-cc-dd-ee-ff").unwrap();
        let twice = normalize_mac(&once).unwrap();
        assert_eq!(once, twice);
        assert!(is_canonical_mac(&once));
    }

    #[test]
    fn test_is_canonical_mac() {
        assert!(is_canonical_mac("AA:BB:CC:DD:EE:01"));
        assert!(!is_canonical_mac("aa:bb:cc:dd:ee:01"));
        assert!(!is_canonical_mac("AA-BB-CC-DD-EE-01"));
        assert!(!is_canonical_mac("AABBCCDDEE01"));
    }
}
