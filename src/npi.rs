//! National Provider Identifier validation: exactly 10 digits, Luhn
//! mod-10 check digit. Used for both provider registrations and the
//! organization's own identity.

/// True if `npi` is exactly 10 ASCII digits and passes the Luhn check.
pub fn is_valid(npi: &str) -> bool {
    if npi.len() != 10 || !npi.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if !matches!(npi.as_bytes()[0], b'1' | b'2') {
        return false;
    }

    let sum: u32 = npi
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let digit = (b - b'0') as u32;
            if i % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                digit
            }
        })
        .sum();

    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_luhn_valid_npi() {
        assert!(is_valid("1234567897"));
    }

    #[test]
    fn rejects_a_luhn_invalid_npi() {
        assert!(!is_valid("1234567893"));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(!is_valid("123456789"));
        assert!(!is_valid("12345678971"));
        assert!(!is_valid(""));
    }

    #[test]
    fn rejects_non_digit_characters() {
        assert!(!is_valid("12345abc97"));
        assert!(!is_valid("123-456-78"));
    }

    #[test]
    fn rejects_all_zeros() {
        assert!(!is_valid("0000000000"));
    }
}
