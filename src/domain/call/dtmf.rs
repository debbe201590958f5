//! DTMF (Dual-Tone Multi-Frequency) digits sent as out-of-band INFO messages

use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use std::time::Duration;

/// Default tone duration signalled in `application/dtmf-relay` bodies
pub const DEFAULT_TONE_DURATION: Duration = Duration::from_millis(160);

/// DTMF digit representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfDigit {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfDigit {
    /// Convert to character representation
    pub fn to_char(&self) -> char {
        match self {
            DtmfDigit::Zero => '0',
            DtmfDigit::One => '1',
            DtmfDigit::Two => '2',
            DtmfDigit::Three => '3',
            DtmfDigit::Four => '4',
            DtmfDigit::Five => '5',
            DtmfDigit::Six => '6',
            DtmfDigit::Seven => '7',
            DtmfDigit::Eight => '8',
            DtmfDigit::Nine => '9',
            DtmfDigit::Star => '*',
            DtmfDigit::Pound => '#',
            DtmfDigit::A => 'A',
            DtmfDigit::B => 'B',
            DtmfDigit::C => 'C',
            DtmfDigit::D => 'D',
        }
    }

    /// Parse from character
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '0' => Some(DtmfDigit::Zero),
            '1' => Some(DtmfDigit::One),
            '2' => Some(DtmfDigit::Two),
            '3' => Some(DtmfDigit::Three),
            '4' => Some(DtmfDigit::Four),
            '5' => Some(DtmfDigit::Five),
            '6' => Some(DtmfDigit::Six),
            '7' => Some(DtmfDigit::Seven),
            '8' => Some(DtmfDigit::Eight),
            '9' => Some(DtmfDigit::Nine),
            '*' => Some(DtmfDigit::Star),
            '#' => Some(DtmfDigit::Pound),
            'A' => Some(DtmfDigit::A),
            'B' => Some(DtmfDigit::B),
            'C' => Some(DtmfDigit::C),
            'D' => Some(DtmfDigit::D),
            _ => None,
        }
    }

    /// Parse a digit string such as `"123#"`. Whitespace is ignored.
    pub fn parse_digits(digits: &str) -> Result<Vec<DtmfDigit>> {
        let parsed = digits
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| {
                DtmfDigit::from_char(c).ok_or_else(|| {
                    DomainError::ValidationError(format!("Invalid DTMF digit: {:?}", c))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if parsed.is_empty() {
            return Err(DomainError::ValidationError("digits is required".to_string()));
        }
        Ok(parsed)
    }

    /// Body of an `application/dtmf-relay` INFO request
    pub fn info_body(&self, duration: Duration) -> String {
        format!("Signal={}\r\nDuration={}\r\n", self.to_char(), duration.as_millis())
    }

    /// Extract the digit from an incoming `application/dtmf-relay` body
    pub fn from_info_body(body: &str) -> Option<Self> {
        body.lines()
            .filter_map(|line| line.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("signal"))
            .and_then(|(_, value)| value.trim().chars().next())
            .and_then(DtmfDigit::from_char)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digits() {
        let digits = DtmfDigit::parse_digits("12 3*#a").unwrap();
        assert_eq!(
            digits,
            vec![
                DtmfDigit::One,
                DtmfDigit::Two,
                DtmfDigit::Three,
                DtmfDigit::Star,
                DtmfDigit::Pound,
                DtmfDigit::A
            ]
        );
    }

    #[test]
    fn test_parse_digits_rejects_garbage() {
        assert!(matches!(
            DtmfDigit::parse_digits("12x"),
            Err(DomainError::ValidationError(_))
        ));
        assert!(DtmfDigit::parse_digits("   ").is_err());
    }

    #[test]
    fn test_info_body() {
        let body = DtmfDigit::Pound.info_body(DEFAULT_TONE_DURATION);
        assert_eq!(body, "Signal=#\r\nDuration=160\r\n");
        assert_eq!(DtmfDigit::from_info_body(&body), Some(DtmfDigit::Pound));
        assert_eq!(DtmfDigit::from_info_body("Duration=100"), None);
    }
}
