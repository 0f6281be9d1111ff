/*
 * Copyright (C) 2026 Tether contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Bit-exact envelope serialization over a buffered byte stream.
//!
//! Each envelope is `0x93` (fixed 3-element array), `0xCC` + kind byte,
//! then method and payload as length-prefixed binary strings. The encoder
//! always picks the narrowest of the three bin widths
//! (<https://github.com/msgpack/msgpack/blob/master/spec.md#bin-format-family>).

use std::io::{BufRead, Write};

use super::{BIN8, BIN16, BIN32, Envelope, FIXED_ARRAY3, MessageKind, ProtocolError, U8_MARKER};

/// Reads one envelope off the stream.
///
/// Returns `Ok(None)` on a clean end of stream, i.e. EOF before the first
/// byte of an envelope. EOF anywhere inside an envelope is a short read and
/// surfaces as an I/O framing error.
///
/// # Errors
///
/// Returns a [`ProtocolError`] on any marker mismatch, unknown kind,
/// non-UTF-8 method, or transport failure.
pub fn read_envelope(reader: &mut impl BufRead) -> Result<Option<Envelope>, ProtocolError> {
    let marker = match read_u8(reader) {
        Ok(byte) => byte,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if marker != FIXED_ARRAY3 {
        return Err(ProtocolError::BadArrayMarker(marker));
    }

    let tag = read_u8(reader)?;
    if tag != U8_MARKER {
        return Err(ProtocolError::BadKindMarker(tag));
    }

    let raw_kind = read_u8(reader)?;
    let kind = MessageKind::from_u8(raw_kind).ok_or(ProtocolError::UnknownKind(raw_kind))?;

    let method = String::from_utf8(read_bin(reader)?).map_err(ProtocolError::InvalidMethod)?;
    let payload = read_bin(reader)?;

    Ok(Some(Envelope {
        kind,
        method,
        payload,
    }))
}

/// Writes one envelope to the stream and flushes it.
///
/// # Errors
///
/// Returns an error if the underlying transport fails.
pub fn write_envelope(
    writer: &mut impl Write,
    kind: MessageKind,
    method: &str,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&[FIXED_ARRAY3, U8_MARKER, kind as u8])?;
    write_bin(writer, method.as_bytes())?;
    write_bin(writer, payload)?;
    writer.flush()
}

fn read_u8(reader: &mut impl BufRead) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_bin(reader: &mut impl BufRead) -> Result<Vec<u8>, ProtocolError> {
    let tag = read_u8(reader)?;
    let size = match tag {
        BIN8 => usize::from(read_u8(reader)?),
        BIN16 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            usize::from(u16::from_be_bytes(len))
        }
        BIN32 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            usize::try_from(u32::from_be_bytes(len)).unwrap_or(usize::MAX)
        }
        other => return Err(ProtocolError::BadBinTag(other)),
    };

    let mut data = vec![0u8; size];
    reader.read_exact(&mut data)?;
    Ok(data)
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "each cast is guarded by the matching length check"
)]
fn write_bin(writer: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    let length = data.len();
    if length < 256 {
        writer.write_all(&[BIN8, length as u8])?;
    } else if length < 1 << 16 {
        writer.write_all(&[BIN16])?;
        writer.write_all(&(length as u16).to_be_bytes())?;
    } else {
        // bin32 is the widest encoding the format has; refuse anything
        // that would not fit rather than emit a corrupt frame.
        let length = u32::try_from(length).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "binary field exceeds the 4 GiB frame limit",
            )
        })?;
        writer.write_all(&[BIN32])?;
        writer.write_all(&length.to_be_bytes())?;
    }
    writer.write_all(data)
}
