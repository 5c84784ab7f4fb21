//! Domain name encoding and decompression.

use std::fmt::Write;

use crate::error::{DecodeError, EncodeError};

pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

const POINTER_MASK: u8 = 0xC0;

/// Strip a single trailing root dot.
pub fn normalize(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Validate `name` against the wire limits without writing anything.
pub fn check(name: &str) -> Result<(), EncodeError> {
    let name = normalize(name);
    if name.is_empty() {
        return Err(EncodeError::EmptyLabel);
    }

    // Terminating zero-length label.
    let mut encoded_len = 1;
    for label in name.split('.') {
        if label.is_empty() {
            return Err(EncodeError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(EncodeError::NameTooLong);
        }
        encoded_len += label.len() + 1;
    }

    if encoded_len > MAX_NAME_LEN {
        return Err(EncodeError::NameTooLong);
    }
    Ok(())
}

/// Append `name` as length-prefixed labels. The name must pass [`check`].
pub fn encode(buf: &mut Vec<u8>, name: &str) {
    for label in normalize(name).split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Decode the name starting at `pos`, following compression pointers.
///
/// Returns the dotted name in presentation form and the offset just past
/// the name at its original location. Label bytes that are not printable
/// ASCII are written as `\DDD`; literal dots and backslashes are escaped,
/// so distinct wire names never decode to the same string.
pub fn decode(data: &[u8], pos: usize) -> Result<(String, usize), DecodeError> {
    let mut name = String::new();
    let end = walk(data, pos, |label| {
        if !name.is_empty() {
            name.push('.');
        }
        push_escaped(&mut name, label);
    })?;
    Ok((name, end))
}

/// Raw labels of the name starting at `pos`, root label excluded.
pub fn labels(data: &[u8], pos: usize) -> Result<(Vec<&[u8]>, usize), DecodeError> {
    let mut labels = Vec::new();
    let end = walk(data, pos, |label| labels.push(label))?;
    Ok((labels, end))
}

/// Visit every label of the name at `pos`.
///
/// Each pointer must target an offset strictly before the previous jump
/// target (initially `pos`), so the walk always terminates.
fn walk<'a>(
    data: &'a [u8],
    pos: usize,
    mut visit: impl FnMut(&'a [u8]),
) -> Result<usize, DecodeError> {
    let mut cursor = pos;
    let mut limit = pos;
    let mut end = None;
    let mut encoded_len = 1;

    loop {
        let Some(&len) = data.get(cursor) else {
            return Err(DecodeError::MalformedPacket("truncated name"));
        };

        match len & POINTER_MASK {
            0x00 if len == 0 => {
                return Ok(end.unwrap_or(cursor + 1));
            }
            0x00 => {
                let len = len as usize;
                let Some(label) = data.get(cursor + 1..cursor + 1 + len) else {
                    return Err(DecodeError::MalformedPacket("truncated label"));
                };

                encoded_len += len + 1;
                if encoded_len > MAX_NAME_LEN {
                    return Err(DecodeError::MalformedName("name exceeds 255 bytes"));
                }

                visit(label);
                cursor += 1 + len;
            }
            POINTER_MASK => {
                let Some(&low) = data.get(cursor + 1) else {
                    return Err(DecodeError::MalformedPacket("truncated pointer"));
                };
                let target = (((len & !POINTER_MASK) as usize) << 8) | low as usize;
                if target >= limit {
                    return Err(DecodeError::MalformedName("pointer does not point backward"));
                }

                end.get_or_insert(cursor + 2);
                limit = target;
                cursor = target;
            }
            _ => {
                return Err(DecodeError::MalformedPacket("label length exceeds 63"));
            }
        }
    }
}

fn push_escaped(name: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(b as char);
            }
            0x21..=0x7E => name.push(b as char),
            _ => {
                let _ = write!(name, "\\{b:03}");
            }
        }
    }
}
