//! Outer framing of script files: byte reversal with a partial XOR mask,
//! zlib compression, then the rotor cipher under a fixed key
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rotor::RotorCipher;

/// Byte XORed into the head of the reversed buffer
pub const XOR_MASK: u8 = 154;

/// Number of leading bytes covered by the mask
pub const XOR_WINDOW: usize = 128;

const KEY_NAME: &str = "j2h56ogodh3se";
const KEY_DOT: &str = "=dziaq.";
const KEY_FILL: &str = "|os=5v7!\"-234";

/// Rotor key shared by both directions of the framing
pub fn redirect_key() -> String {
    let mut key = KEY_NAME.repeat(4);
    key.push_str(&[KEY_DOT, KEY_NAME, KEY_FILL].concat().repeat(5));
    key.push_str("!#");
    key.push_str(&KEY_DOT.repeat(7));
    key.push_str(&KEY_FILL.repeat(2));
    key.push_str("*&'");
    key
}

/// Reverse `data`, then mask the first [`XOR_WINDOW`] bytes of the result
pub fn reverse_and_mask(data: &[u8]) -> Vec<u8> {
    let mut buf: Vec<u8> = data.iter().rev().copied().collect();
    for b in buf.iter_mut().take(XOR_WINDOW) {
        *b ^= XOR_MASK;
    }
    buf
}

/// Unmask the first [`XOR_WINDOW`] bytes, then reverse; undoes [`reverse_and_mask`]
pub fn unmask_and_reverse(data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    for b in buf.iter_mut().take(XOR_WINDOW) {
        *b ^= XOR_MASK;
    }
    buf.reverse();
    buf
}

/// Decrypt a script file into its payload
pub fn redirect(data: &[u8]) -> Result<Vec<u8>> {
    let mut rotor = RotorCipher::new(redirect_key());
    let compressed = rotor.decrypt(data);

    let mut inflated = Vec::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut inflated)
        .map_err(Error::Inflate)?;

    let payload = unmask_and_reverse(&inflated);
    debug!(input = data.len(), inflated = inflated.len(), "redirect");
    Ok(payload)
}

/// Encrypt a payload into the script file format; inverse of [`redirect`]
pub fn unredirect(payload: &[u8]) -> Result<Vec<u8>> {
    let masked = reverse_and_mask(payload);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&masked)?;
    let compressed = encoder.finish()?;

    let mut rotor = RotorCipher::new(redirect_key());
    let out = rotor.encrypt(&compressed);
    debug!(input = payload.len(), compressed = compressed.len(), "unredirect");
    Ok(out)
}
