//! Decoding of strings sent by the remote engine.
//!
//! The engine transmits strings as UTF-8 bytes widened to one character per
//! byte. Text that does not have that shape is returned unchanged.

use std::borrow::Cow;

/// Reassembles the UTF-8 byte sequence carried by `text`.
///
/// Returns `text` itself when a character is outside the byte range or the
/// bytes are not valid UTF-8.
pub fn decode_remote_string(text: &str) -> Cow<'_, str> {
    if text.is_ascii() {
        return Cow::Borrowed(text);
    }
    let bytes: Option<Vec<u8>> = text.chars().map(|c| u8::try_from(c).ok()).collect();
    match bytes.map(String::from_utf8) {
        Some(Ok(decoded)) => Cow::Owned(decoded),
        _ => Cow::Borrowed(text),
    }
}
