//! In-place field surgery on compact serialized messages.
//!
//! Locates, reads, rewrites and removes single `"key":value` fields inside a
//! `{"k":v,"k2":v2}` buffer without decoding it. Used for the checksum field,
//! where a decode/re-encode round trip per frame is too costly on small links.
//! Buffers must be compact (no whitespace between tokens), as produced by
//! [`crate::wire::encode`].

/// Shape of the value at a field's value position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Other,
    /// Key absent, or the value runs off the end of the buffer.
    Void,
}

/// Error rewriting a field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("buffer is not a closed object")]
    Unterminated,
    #[error("field {0:?} not found")]
    Missing(String),
}

/// Position of the colon following the top-level `"key"`, scanning from the
/// earliest index it can appear at (4 for a single-character key). Keys inside
/// nested values never match.
pub fn locate_colon(buf: &[u8], key: &str) -> Option<usize> {
    locate_colon_from(buf, key, key.len() + 3)
}

pub fn locate_colon_from(buf: &[u8], key: &str, start: usize) -> Option<usize> {
    let key = key.as_bytes();
    if key.is_empty() || buf.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'"' => {
                let close = text_end(buf, i)?;
                let colon = close + 1;
                if depth == 1
                    && colon >= start
                    && buf.get(colon) == Some(&b':')
                    && &buf[i + 1..close] == key
                {
                    return Some(colon);
                }
                i = close;
            }
            b'[' | b'{' => depth += 1,
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    None
}

/// First byte of the value.
pub fn value_position(colon: usize) -> usize {
    colon + 1
}

/// First byte of the key name (just after its opening quote).
pub fn key_position(colon: usize, key: &str) -> usize {
    colon - 1 - key.len()
}

pub fn classify_value(buf: &[u8], key: &str) -> FieldKind {
    match locate_colon(buf, key) {
        Some(colon) => classify_at(buf, value_position(colon)),
        None => FieldKind::Void,
    }
}

fn classify_at(buf: &[u8], at: usize) -> FieldKind {
    match buf.get(at) {
        None => FieldKind::Void,
        Some(b'"') => match text_end(buf, at) {
            Some(_) => FieldKind::Text,
            None => FieldKind::Void,
        },
        Some(_) => {
            let mut digits = 0;
            for &b in &buf[at..] {
                match b {
                    b'0'..=b'9' => digits += 1,
                    b',' | b'}' if digits > 0 => return FieldKind::Integer,
                    _ => return FieldKind::Other,
                }
            }
            FieldKind::Void
        }
    }
}

/// Index of the quote closing the string opened at `open`.
fn text_end(buf: &[u8], open: usize) -> Option<usize> {
    let mut escaped = false;
    for (i, &b) in buf.iter().enumerate().skip(open + 1) {
        match b {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'"' => return Some(i),
            _ => {}
        }
    }
    None
}

/// One past the last byte of the value starting at `at`.
fn value_end(buf: &[u8], at: usize) -> Option<usize> {
    if buf.get(at) == Some(&b'"') {
        return text_end(buf, at).map(|close| close + 1);
    }
    let mut depth = 0usize;
    let mut i = at;
    while i < buf.len() {
        match buf[i] {
            b'"' => i = text_end(buf, i)?,
            b'[' | b'{' => depth += 1,
            b']' | b'}' if depth > 0 => depth -= 1,
            b',' | b'}' if depth == 0 => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Bytes taken by `"key":value`, quotes included, separating comma excluded.
pub fn field_length(buf: &[u8], key: &str) -> Option<usize> {
    let colon = locate_colon(buf, key)?;
    let end = value_end(buf, value_position(colon))?;
    Some(end - (key_position(colon, key) - 1))
}

/// Decimal digits at the value position; 0 when the key is absent.
pub fn read_integer(buf: &[u8], key: &str) -> u64 {
    let Some(colon) = locate_colon(buf, key) else {
        return 0;
    };
    buf[value_position(colon)..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u64, |acc, b| {
            acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
        })
}

/// Raw text value (escapes left as-is).
pub fn read_text<'a>(buf: &'a [u8], key: &str) -> Option<&'a str> {
    let colon = locate_colon(buf, key)?;
    let open = value_position(colon);
    if buf.get(open) != Some(&b'"') {
        return None;
    }
    let close = text_end(buf, open)?;
    std::str::from_utf8(&buf[open + 1..close]).ok()
}

/// Delete the field and one adjacent comma (the leading one if there is one).
/// Returns the new buffer length, or `None` if the key is absent.
pub fn remove(buf: &mut Vec<u8>, key: &str) -> Option<usize> {
    let colon = locate_colon(buf, key)?;
    let mut start = key_position(colon, key) - 1;
    let mut end = value_end(buf, value_position(colon))?;
    if buf[start - 1] == b',' {
        start -= 1;
    } else if buf.get(end) == Some(&b',') {
        end += 1;
    }
    buf.drain(start..end);
    Some(buf.len())
}

/// Remove any existing `key` and append `"key":value` before the closing brace.
/// Returns the new buffer length.
pub fn set_integer(buf: &mut Vec<u8>, key: &str, value: u64) -> Result<usize, FieldError> {
    if buf.first() != Some(&b'{') || buf.last() != Some(&b'}') {
        return Err(FieldError::Unterminated);
    }
    remove(buf, key);
    let close = buf.len() - 1;
    let mut field = Vec::with_capacity(key.len() + 24);
    if buf[close - 1] != b'{' {
        field.push(b',');
    }
    field.push(b'"');
    field.extend_from_slice(key.as_bytes());
    field.extend_from_slice(b"\":");
    push_digits(&mut field, value);
    buf.splice(close..close, field);
    Ok(buf.len())
}

/// Overwrite the value of an existing field with `value`, keeping its position.
pub fn replace_integer(buf: &mut Vec<u8>, key: &str, value: u64) -> Result<usize, FieldError> {
    let colon = locate_colon(buf, key).ok_or_else(|| FieldError::Missing(key.to_string()))?;
    let at = value_position(colon);
    let end = value_end(buf, at).ok_or(FieldError::Unterminated)?;
    let mut digits = Vec::with_capacity(20);
    push_digits(&mut digits, value);
    buf.splice(at..end, digits);
    Ok(buf.len())
}

/// Most significant digit first; zero is a single `0`.
fn push_digits(out: &mut Vec<u8>, mut value: u64) {
    let mut scratch = [0u8; 20];
    let mut n = scratch.len();
    loop {
        n -= 1;
        scratch[n] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    out.extend_from_slice(&scratch[n..]);
}
