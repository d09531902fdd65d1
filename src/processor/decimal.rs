//! Fixed-point decimal with ten fractional digits, stored as a scaled `i64`.

use std::fmt;
use std::str::FromStr;

pub const FRACTIONAL_DIGITS: u32 = 10;
pub const SCALE: i64 = 10_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal(i64);

impl Decimal {
    pub const ZERO: Decimal = Decimal(0);
    pub const ONE: Decimal = Decimal(SCALE);

    /// Wraps an already scaled value (`value / 10^10`).
    pub const fn from_unbiased(value: i64) -> Self {
        Decimal(value)
    }

    pub const fn unbiased(self) -> i64 {
        self.0
    }

    pub fn from_int(value: i64) -> Option<Self> {
        value.checked_mul(SCALE).map(Decimal)
    }

    /// Integer part, truncated toward zero.
    pub fn to_int(self) -> i64 {
        self.0 / SCALE
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Self {
        Decimal(self.0.saturating_abs())
    }

    pub fn checked_neg(self) -> Option<Self> {
        self.0.checked_neg().map(Decimal)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Decimal)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Decimal)
    }

    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        let wide = self.0 as i128 * rhs.0 as i128;
        narrow(div_round(wide, SCALE as i128))
    }

    /// `None` on division by zero or overflow.
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        if rhs.0 == 0 {
            return None;
        }
        let wide = self.0 as i128 * SCALE as i128;
        narrow(div_round(wide, rhs.0 as i128))
    }

    /// Drops every fractional digit past `places`.
    pub fn trunc(self, places: u32) -> Self {
        if places >= FRACTIONAL_DIGITS {
            return self;
        }
        let step = 10i64.pow(FRACTIONAL_DIGITS - places);
        Decimal(self.0 / step * step)
    }

    /// Parses `[+-]digits[.digits]`; digits past the tenth decimal are dropped.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (negative, body) = match text.as_bytes().first()? {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let mut value: i64 = 0;
        for b in int_part.bytes() {
            value = value.checked_mul(10)?.checked_add((b - b'0') as i64)?;
        }
        value = value.checked_mul(SCALE)?;

        let mut frac: i64 = 0;
        let mut digits = 0;
        for b in frac_part.bytes().take(FRACTIONAL_DIGITS as usize) {
            frac = frac * 10 + (b - b'0') as i64;
            digits += 1;
        }
        frac *= 10i64.pow(FRACTIONAL_DIGITS - digits);
        value = value.checked_add(frac)?;

        Some(Decimal(if negative { -value } else { value }))
    }

    /// Parses a number written with the given decimal point and thousands
    /// separator (`1.234,56` with `,` / `.`).
    pub fn parse_locale(text: &str, decimal_point: char, thousands_sep: Option<char>) -> Option<Self> {
        let mut canonical = String::with_capacity(text.len());
        for c in text.trim().chars() {
            if c == decimal_point {
                canonical.push('.');
            } else if Some(c) == thousands_sep {
                continue;
            } else if c == '.' {
                // a dot that is neither separator would be misread as the point
                return None;
            } else {
                canonical.push(c);
            }
        }
        Self::parse(&canonical)
    }
}

fn div_round(num: i128, den: i128) -> i128 {
    let q = num / den;
    let r = num % den;
    if r.abs() * 2 >= den.abs() {
        if (num < 0) != (den < 0) { q - 1 } else { q + 1 }
    } else {
        q
    }
}

fn narrow(value: i128) -> Option<Decimal> {
    i64::try_from(value).ok().map(Decimal)
}

impl From<i32> for Decimal {
    fn from(value: i32) -> Self {
        Decimal(value as i64 * SCALE)
    }
}

impl FromStr for Decimal {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::parse(s).ok_or(())
    }
}

/// Shortest form: trailing fractional zeros (and a bare point) are dropped.
impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let int_part = abs / SCALE as u64;
        let frac_part = abs % SCALE as u64;
        if frac_part == 0 {
            return write!(f, "{sign}{int_part}");
        }
        let frac = format!("{frac_part:010}");
        write!(f, "{sign}{int_part}.{}", frac.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let test_cases = vec![
            ("0", "0"),
            ("12", "12"),
            ("-12.50", "-12.5"),
            ("+0.0000000001", "0.0000000001"),
            ("3.", "3"),
            (".25", "0.25"),
            ("1.123456789012", "1.123456789"),
        ];
        for (input, expected) in test_cases {
            assert_eq!(d(input).to_string(), expected, "{input}");
        }
        assert_eq!(Decimal::parse(""), None);
        assert_eq!(Decimal::parse("1.2.3"), None);
        assert_eq!(Decimal::parse("12a"), None);
        assert_eq!(Decimal::parse("-"), None);
    }

    #[test]
    fn test_parse_locale() {
        assert_eq!(Decimal::parse_locale("1.234,56", ',', Some('.')), Some(d("1234.56")));
        assert_eq!(Decimal::parse_locale("1,234.56", '.', Some(',')), Some(d("1234.56")));
        assert_eq!(Decimal::parse_locale("  -7,5 ", ',', None), Some(d("-7.5")));
        assert_eq!(Decimal::parse_locale("7.5", ',', None), None);
        assert_eq!(Decimal::parse_locale("abc", '.', Some(',')), None);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(d("1.5").checked_add(d("2.25")), Some(d("3.75")));
        assert_eq!(d("1.5").checked_sub(d("2.25")), Some(d("-0.75")));
        assert_eq!(d("1.5").checked_mul(d("-4")), Some(d("-6")));
        assert_eq!(d("1").checked_div(d("3")).unwrap().to_string(), "0.3333333333");
        assert_eq!(d("2").checked_div(d("3")).unwrap().to_string(), "0.6666666667");
        assert_eq!(d("1").checked_div(Decimal::ZERO), None);
        assert_eq!(Decimal::from_unbiased(i64::MAX).checked_add(Decimal::ONE), None);
    }

    #[test]
    fn test_trunc_and_int() {
        assert_eq!(d("12.3456").trunc(2), d("12.34"));
        assert_eq!(d("-12.3456").trunc(0), d("-12"));
        assert_eq!(d("-12.9").to_int(), -12);
        assert_eq!(Decimal::from(7).to_int(), 7);
    }
}
