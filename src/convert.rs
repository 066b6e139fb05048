//! Text rendering and parsing used by the `*toa` and `ato*` instructions.

use crate::Value;

/// Longest string the `ato*` conversions look at.
pub const MAX_PARSE_LEN: usize = 63;

/// Formats a float the way C's `%g` does with the default precision of six
/// significant digits.
pub fn format_g(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            strip_fraction_zeros(mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        strip_fraction_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_fraction_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Parses the longest integer prefix the way `atol` does: leading
/// whitespace, an optional sign, then decimal digits. Anything unparsable
/// yields `0` and overflow saturates.
pub fn parse_int_prefix(text: &[u8]) -> i64 {
    let text = skip_space(text);
    let (negative, digits) = match text.first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let mut result: i64 = 0;
    for digit in digits.iter().take_while(|c| c.is_ascii_digit()) {
        let digit = (digit - b'0') as i64;
        result = if negative {
            result.saturating_mul(10).saturating_sub(digit)
        } else {
            result.saturating_mul(10).saturating_add(digit)
        };
    }
    result
}

/// Parses the longest float prefix the way `atof` does, including `inf`,
/// `infinity` and `nan`. Anything unparsable yields `0.0`.
pub fn parse_float_prefix(text: &[u8]) -> f64 {
    let text = skip_space(text);
    let (sign, body) = match text.first() {
        Some(b'-') => (-1.0, &text[1..]),
        Some(b'+') => (1.0, &text[1..]),
        _ => (1.0, text),
    };

    let lower: Vec<u8> = body.iter().take(8).map(u8::to_ascii_lowercase).collect();
    if lower.starts_with(b"inf") {
        return sign * f64::INFINITY;
    }
    if lower.starts_with(b"nan") {
        return f64::NAN;
    }

    let mut end = 0;
    let digits = |from: usize| {
        body[from..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count()
    };

    let whole = digits(end);
    end += whole;
    let mut fraction = 0;
    if body.get(end) == Some(&b'.') {
        fraction = digits(end + 1);
        if whole > 0 || fraction > 0 {
            end += 1 + fraction;
        }
    }
    if whole == 0 && fraction == 0 {
        return 0.0;
    }

    if matches!(body.get(end), Some(b'e') | Some(b'E')) {
        let mut exp_end = end + 1;
        if matches!(body.get(exp_end), Some(b'-') | Some(b'+')) {
            exp_end += 1;
        }
        let exp_digits = digits(exp_end);
        if exp_digits > 0 {
            end = exp_end + exp_digits;
        }
    }

    std::str::from_utf8(&body[..end])
        .ok()
        .and_then(|number| number.parse::<f64>().ok())
        .map_or(0.0, |number| sign * number)
}

fn skip_space(text: &[u8]) -> &[u8] {
    let start = text
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(text.len());
    &text[start..]
}

/// Byte a list element contributes to a string. Ints contribute their low
/// byte; elements that are not characters read as `?`.
pub fn element_byte(value: &Value) -> u8 {
    match value {
        Value::Byte(byte) => *byte,
        Value::Int(int) => *int as u8,
        _ => b'?',
    }
}

/// The C string a list of characters spells: at most `MAX_PARSE_LEN` bytes,
/// cut at the first NUL.
pub fn c_string<'a, I>(elements: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Value>,
{
    elements
        .into_iter()
        .map(element_byte)
        .take(MAX_PARSE_LEN)
        .take_while(|byte| *byte != 0)
        .collect()
}
