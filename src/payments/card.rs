//! Card number, expiry and brand checks run on every edit of the card form.
//!
//! Everything here is pure: no I/O, no logging of card data.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const MIN_PAN_DIGITS: usize = 13;
const MAX_PAN_DIGITS: usize = 19;
const MIN_CVV_DIGITS: usize = 3;
const MIN_HOLDER_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardBrand {
    Visa,
    Mastercard,
    Jcb,
    Unknown,
}

/// Detects the card network from the leading digits.
pub fn detect_brand(number: &str) -> CardBrand {
    let digits = strip_whitespace(number);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return CardBrand::Unknown;
    }

    if digits.starts_with('4') {
        return CardBrand::Visa;
    }
    if let Some(two) = leading(&digits, 2) {
        if (51..=55).contains(&two) {
            return CardBrand::Mastercard;
        }
        if two == 35 {
            return CardBrand::Jcb;
        }
    }
    // 2-series Mastercard BINs
    if let Some(four) = leading(&digits, 4) {
        if (2221..=2720).contains(&four) {
            return CardBrand::Mastercard;
        }
    }
    CardBrand::Unknown
}

/// Luhn check over 13–19 digits; whitespace is ignored.
pub fn is_valid_number(number: &str) -> bool {
    let digits = strip_whitespace(number);
    if digits.len() < MIN_PAN_DIGITS || digits.len() > MAX_PAN_DIGITS {
        return false;
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    luhn_checksum(&digits) % 10 == 0
}

fn luhn_checksum(digits: &str) -> u32 {
    digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum()
}

/// `MM/YY` expiry not earlier than the current month.
pub fn is_valid_expiry(mm_yy: &str) -> bool {
    is_valid_expiry_on(mm_yy, Utc::now().date_naive())
}

/// Expiry check against an explicit "today".
pub fn is_valid_expiry_on(mm_yy: &str, today: NaiveDate) -> bool {
    let Some((month, year)) = parse_expiry(mm_yy) else {
        return false;
    };
    let expiry = i64::from(year) * 12 + i64::from(month);
    let current = i64::from(today.year()) * 12 + i64::from(today.month());
    expiry >= current
}

/// Parses an exact `MM/YY` string into `(month, four-digit year)`.
fn parse_expiry(mm_yy: &str) -> Option<(u32, i32)> {
    let bytes = mm_yy.as_bytes();
    if bytes.len() != 5 || bytes[2] != b'/' {
        return None;
    }
    let (mm, yy) = (&mm_yy[..2], &mm_yy[3..]);
    if !mm.bytes().chain(yy.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let month: u32 = mm.parse().ok()?;
    let year: i32 = yy.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((month, 2000 + year))
}

/// Raw card form fields. Validity is always derived, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardInput {
    pub number: String,
    pub expiry: String,
    pub cvv: String,
    pub holder_name: String,
}

/// Result of the four independent card checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CardCheck {
    pub brand: CardBrand,
    pub number_ok: bool,
    pub expiry_ok: bool,
    pub cvv_ok: bool,
    pub holder_ok: bool,
}

impl CardCheck {
    pub fn is_valid(&self) -> bool {
        self.number_ok && self.expiry_ok && self.cvv_ok && self.holder_ok
    }

    /// Guidance for the first failing check, in form order.
    pub fn first_problem(&self) -> Option<&'static str> {
        if !self.number_ok {
            Some("Card number is invalid")
        } else if !self.expiry_ok {
            Some("Card expiry must be MM/YY and not in the past")
        } else if !self.cvv_ok {
            Some("CVV must be at least 3 digits")
        } else if !self.holder_ok {
            Some("Enter the name printed on the card")
        } else {
            None
        }
    }
}

impl CardInput {
    pub fn new(
        number: impl Into<String>,
        expiry: impl Into<String>,
        cvv: impl Into<String>,
        holder_name: impl Into<String>,
    ) -> Self {
        Self {
            number: number.into(),
            expiry: expiry.into(),
            cvv: cvv.into(),
            holder_name: holder_name.into(),
        }
    }

    pub fn check(&self) -> CardCheck {
        self.check_on(Utc::now().date_naive())
    }

    pub fn check_on(&self, today: NaiveDate) -> CardCheck {
        CardCheck {
            brand: detect_brand(&self.number),
            number_ok: is_valid_number(&self.number),
            expiry_ok: is_valid_expiry_on(&self.expiry, today),
            cvv_ok: self.cvv.len() >= MIN_CVV_DIGITS && self.cvv.chars().all(|c| c.is_ascii_digit()),
            holder_ok: self.holder_name.trim().chars().count() >= MIN_HOLDER_CHARS,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_valid()
    }
}

fn strip_whitespace(number: &str) -> String {
    number.chars().filter(|c| !c.is_whitespace()).collect()
}

fn leading(digits: &str, n: usize) -> Option<u32> {
    digits.get(..n)?.parse().ok()
}
