//! Binary-safe text codec shared by parents and the scripts they launch.
//!
//! Arbitrary text is carried as lowercase hex of its UTF-8 bytes. Argument
//! lists are serialized as a JSON array first, so an interpreter-mode script
//! receives exactly one opaque argument no matter what the caller passed.
use serde::Serialize;
use serde_json::Value;
use std::{
    env,
    io::{self, Write},
};

use crate::error::{DecodeError, ToolkitError};

/// Text a child prints (encoded) to ask its parent to clear the console.
pub const CLEAR_MARKER: &str = "*** Clear Terminal ***";

/// Delimiter wrapped around payloads printed by [`emit_output`].
const PAYLOAD_DELIMITER: char = ';';

/// Encodes text into its hex transport form.
pub fn encode(text: &str) -> String {
    hex::encode(text.as_bytes())
}

/// Decodes hex transport text. Surrounding whitespace and `;` delimiters are ignored.
pub fn decode(encoded: &str) -> Result<String, DecodeError> {
    let trimmed = encoded.trim().trim_matches(PAYLOAD_DELIMITER);
    let bytes = hex::decode(trimmed)?;
    Ok(String::from_utf8(bytes)?)
}

/// Packs an argument list into a single transport-safe argument.
pub fn encode_args<S: AsRef<str>>(args: &[S]) -> String {
    let list: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    encode(&Value::from(list).to_string())
}

/// Recovers an argument list packed by [`encode_args`].
pub fn decode_args(encoded: &str) -> Result<Vec<String>, DecodeError> {
    let json = decode(encoded)?;
    Ok(serde_json::from_str(&json)?)
}

/// The encoded clear marker as it appears on a child's stdout.
pub fn clear_marker() -> String {
    encode(CLEAR_MARKER)
}

/// Returns true when a line of child output carries the clear marker.
pub fn is_clear_marker(line: &str) -> bool {
    line.contains(&clear_marker())
}

/// Child side: decodes the packed argument list this process was launched with.
pub fn child_args() -> Result<Vec<String>, DecodeError> {
    let packed = env::args().nth(1).ok_or(DecodeError::MissingArgument)?;
    decode_args(&packed)
}

/// Child side: asks the parent to reset its captured stdout, then prints
/// `value` as `;<hex(json)>;` so the parent can read it with hex decoding.
pub fn emit_output<T: Serialize>(value: &T) -> Result<(), ToolkitError> {
    write_output(&mut io::stdout().lock(), value)
}

fn write_output<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), ToolkitError> {
    let json = serde_json::to_string(value).map_err(DecodeError::from)?;
    writeln!(out, "{}", clear_marker())?;
    writeln!(out, "{PAYLOAD_DELIMITER}{}{PAYLOAD_DELIMITER}", encode(&json))?;
    out.flush()?;
    Ok(())
}
