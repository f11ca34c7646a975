//! Bracket escaping shared by every identity encoding.
//!
//! A reserved character `c` is written as `[<decimal code point of c>]`.
//! The brackets themselves are always reserved, so in escaped output a `[`
//! can only ever open a well-formed escape token.

pub(crate) const SEPARATOR: char = '.';
const OPEN: char = '[';
const CLOSE: char = ']';

/// Escape brackets plus every character `reserved` selects.
pub(crate) fn escape_with(input: &str, reserved: impl Fn(char) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == OPEN || c == CLOSE || reserved(c) {
            push_token(&mut out, c);
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape one identity segment so it can be joined with [`SEPARATOR`].
pub(crate) fn escape_segment(input: &str) -> String {
    escape_with(input, |c| c == SEPARATOR)
}

/// Reverse [`escape_with`]. Malformed tokens are copied through literally.
pub(crate) fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len_utf8()..];
        match decode_token(after) {
            Some((c, consumed)) => {
                out.push(c);
                rest = &after[consumed..];
            }
            None => {
                out.push(OPEN);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn push_token(out: &mut String, c: char) {
    out.push(OPEN);
    out.push_str(&u32::from(c).to_string());
    out.push(CLOSE);
}

/// `input` begins just past an opening bracket. Returns the decoded
/// character and the number of bytes consumed including the closing bracket.
fn decode_token(input: &str) -> Option<(char, usize)> {
    let end = input.find(CLOSE)?;
    let digits = &input[..end];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u32 = digits.parse().ok()?;
    let c = char::from_u32(code)?;
    Some((c, end + CLOSE.len_utf8()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_characters_become_tokens() {
        assert_eq!(escape_segment("a.b"), "a[46]b");
        assert_eq!(escape_segment("[x]"), "[91]x[93]");
        assert_eq!(escape_segment("plain"), "plain");
    }

    #[test]
    fn token_lookalikes_survive() {
        let raw = "[46]";
        let escaped = escape_segment(raw);
        assert_eq!(escaped, "[91]46[93]");
        assert_eq!(unescape(&escaped), raw);
    }

    #[test]
    fn malformed_tokens_pass_through() {
        assert_eq!(unescape("a[b"), "a[b");
        assert_eq!(unescape("[]"), "[]");
        assert_eq!(unescape("[12x]"), "[12x]");
        assert_eq!(unescape("[99999999999]"), "[99999999999]");
        assert_eq!(unescape("[55296]"), "[55296]");
    }

    #[test]
    fn multibyte_characters_round_trip() {
        let raw = "ünï.cødé]";
        assert_eq!(unescape(&escape_segment(raw)), raw);
    }
}
