//! 値デコード機能
//!
//! メモリから読み取ったバイト列を、基本型のエンコーディングに従って文字列にします。

use crate::type_info::PrimitiveEncoding;

/// 先頭 `N` バイトを配列として取り出す
fn take<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.get(..N)?.try_into().ok()
}

/// リトルエンディアンの符号なし整数として読む（最大8バイト）
pub fn read_unsigned(bytes: &[u8], size: usize) -> Option<u64> {
    if size == 0 || size > 8 || bytes.len() < size {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&bytes[..size]);
    Some(u64::from_le_bytes(buf))
}

/// リトルエンディアンの符号付き整数として読む（最大8バイト）
pub fn read_signed(bytes: &[u8], size: usize) -> Option<i64> {
    let raw = read_unsigned(bytes, size)?;
    let shift = 64 - (size as u32) * 8;
    Some(((raw << shift) as i64) >> shift)
}

/// 基本型の値を文字列にする
///
/// 128ビット整数も扱う。読めない場合は `None`。
pub fn format_primitive(bytes: &[u8], encoding: PrimitiveEncoding, size: u64) -> Option<String> {
    let size = size as usize;
    match (encoding, size) {
        (PrimitiveEncoding::Boolean, _) => bytes.first().map(|b| (*b != 0).to_string()),
        (PrimitiveEncoding::Char, 4) => {
            let code = u32::from_le_bytes(take::<4>(bytes)?);
            char::from_u32(code).map(|c| format!("{:?}", c))
        }
        (PrimitiveEncoding::Float, 4) => Some(f32::from_le_bytes(take::<4>(bytes)?).to_string()),
        (PrimitiveEncoding::Float, 8) => Some(f64::from_le_bytes(take::<8>(bytes)?).to_string()),
        (PrimitiveEncoding::Signed, 16) => Some(i128::from_le_bytes(take::<16>(bytes)?).to_string()),
        (PrimitiveEncoding::Unsigned, 16) => {
            Some(u128::from_le_bytes(take::<16>(bytes)?).to_string())
        }
        (PrimitiveEncoding::Signed, _) => read_signed(bytes, size).map(|v| v.to_string()),
        (PrimitiveEncoding::Unsigned, _) | (PrimitiveEncoding::Char, _) => {
            read_unsigned(bytes, size).map(|v| v.to_string())
        }
        _ => None,
    }
}
