// file: src/iso/bytes.rs
// version: 1.0.0
// guid: 479377ee-9c69-4bff-bf65-3e24940881af

//! Little/big/both-endian field helpers (ECMA-119 7.2 and 7.3)

use crate::error::{AutoInstallError, Result};

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| {
            AutoInstallError::layout(format!(
                "field at offset {} runs past the end of a {}-byte structure",
                offset,
                buf.len()
            ))
        })
}

pub(crate) fn u16_le(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(buf, offset)?))
}

pub(crate) fn u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(buf, offset)?))
}

pub(crate) fn u32_be(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(field(buf, offset)?))
}

pub(crate) fn put_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32_be(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// 16-bit value recorded little-endian then big-endian
pub(crate) fn put_both_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// 32-bit value recorded little-endian then big-endian
pub(crate) fn put_both_u32(buf: &mut [u8], offset: usize, value: u32) {
    put_u32_le(buf, offset, value);
    put_u32_be(buf, offset + 4, value);
}
