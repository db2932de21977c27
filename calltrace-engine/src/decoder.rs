//! 値デコード機能
//!
//! ホストが報告する型名と生のバイト列だけを手がかりに、引数値を文字列に
//! 変換します。型名による判定は閉じた決定表で、先にマッチした規則が使われます。
//! デコードは失敗せず、不確かな場合は `<unavailable>` を返します。

use crate::config::DecodeConfig;
use crate::host::ValueView;
use crate::naming::{generic_args, last_segment};
use num_bigint::{BigInt, BigUint};
use num_traits::{One, Zero};
use std::fmt::Write as _;

/// 値が読み取れないことを表すマーカー
pub const UNAVAILABLE: &str = "<unavailable>";

/// 全ゼロのアドレスを表すマーカー
pub const ZERO_ADDRESS: &str = "<zero address>";

/// アドレス型のバイト数
const ADDRESS_LEN: usize = 20;

/// 多倍長整数として読むリムの最大数
const MAX_LIMBS: usize = 64;

/// 型名が示す幅がデコードできる範囲か
fn limbs_in_range(bits: usize, limbs: usize) -> bool {
    limbs <= MAX_LIMBS && bits <= limbs * 64
}

/// 型名から判定した値の種類
#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueKind {
    /// `FixedBytes<N>`
    FixedBytes(usize),
    /// `Address`
    Address,
    /// `Uint<BITS, LIMBS>`
    Uint { bits: usize, limbs: usize },
    /// `Signed<BITS, LIMBS>`
    Signed { bits: usize, limbs: usize },
    /// 単一の配列子要素を包む `Bytes`
    BytesWrapper,
    /// `&[u8]` または `Vec<u8>`
    ByteSequence,
    /// その他
    Other,
}

/// ジェネリック引数の整数列を取り出す（`Uint<256, 4>` → `[256, 4]`）
fn numeric_args(segment: &str, head: &str) -> Option<Vec<usize>> {
    generic_args(segment, head)?
        .into_iter()
        .map(|arg| arg.parse::<usize>().ok())
        .collect()
}

/// バイトスライスとみなす型名
const BYTE_SLICE_TYPES: &[&str] = &["&[u8]", "&mut [u8]", "[u8]"];

/// ヒープ上のバイトベクタか
///
/// DWARFの型名は `Vec<u8, alloc::alloc::Global>` のように外側が修飾されない
/// ことも、`alloc::vec::Vec<u8>` のように修飾されることもある。
fn is_byte_vec(last: &str) -> bool {
    generic_args(last, "Vec").is_some_and(|args| args.first() == Some(&"u8"))
}

impl ValueKind {
    /// 型名から種類を判定する
    fn classify(type_name: &str) -> Self {
        let type_name = type_name.trim();
        if BYTE_SLICE_TYPES.contains(&type_name) {
            return ValueKind::ByteSequence;
        }

        // 外側の型だけを見る（`Vec<FixedBytes<32>>` を FixedBytes と誤認しない）
        let last = last_segment(type_name);
        if last.is_empty() {
            return ValueKind::Other;
        }
        if is_byte_vec(last) {
            return ValueKind::ByteSequence;
        }

        if let Some(args) = numeric_args(last, "FixedBytes") {
            if let [len] = args.as_slice() {
                return ValueKind::FixedBytes(*len);
            }
        }
        if last == "Address" {
            return ValueKind::Address;
        }
        if let Some(args) = numeric_args(last, "Uint") {
            if let [bits, limbs] = args.as_slice() {
                return ValueKind::Uint {
                    bits: *bits,
                    limbs: *limbs,
                };
            }
        }
        if let Some(args) = numeric_args(last, "Signed") {
            if let [bits, limbs] = args.as_slice() {
                return ValueKind::Signed {
                    bits: *bits,
                    limbs: *limbs,
                };
            }
        }
        if last == "Bytes" {
            return ValueKind::BytesWrapper;
        }
        ValueKind::Other
    }
}

/// バイト列を `0x` 付きの小文字16進数にする
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// ホスト由来の文字列が意味のある値か
fn meaningful(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.is_empty() && t != UNAVAILABLE)
}

/// 値デコーダー
#[derive(Debug, Clone, Default)]
pub struct ValueDecoder {
    config: DecodeConfig,
}

impl ValueDecoder {
    /// 新しい値デコーダーを作成する
    pub fn new(config: DecodeConfig) -> Self {
        Self { config }
    }

    /// 値を文字列にデコードする
    pub fn decode(&self, value: &dyn ValueView) -> String {
        self.decode_at(value, 0)
    }

    /// 深さを指定してデコードする
    fn decode_at(&self, value: &dyn ValueView, depth: usize) -> String {
        let rendered = self
            .decode_value(value, depth)
            .unwrap_or_else(|| UNAVAILABLE.to_string());

        if self.config.zero_as_unavailable && rendered == "0" {
            return UNAVAILABLE.to_string();
        }
        rendered
    }

    fn decode_value(&self, value: &dyn ValueView, depth: usize) -> Option<String> {
        let type_name = value.type_name().unwrap_or_default();

        let special = match ValueKind::classify(&type_name) {
            ValueKind::FixedBytes(len) if len > self.config.max_buffer_len => {
                return Some(UNAVAILABLE.to_string());
            }
            ValueKind::Uint { bits, limbs } | ValueKind::Signed { bits, limbs }
                if !limbs_in_range(bits, limbs) =>
            {
                return Some(UNAVAILABLE.to_string());
            }
            ValueKind::FixedBytes(len) => self.decode_fixed_bytes(value, len),
            ValueKind::Address => self.decode_address(value),
            ValueKind::Uint { bits, limbs } => {
                self.read_limbs(value, bits, limbs).map(|n| n.to_string())
            }
            ValueKind::Signed { bits, limbs } => {
                if !value.is_available() {
                    return Some(UNAVAILABLE.to_string());
                }
                self.decode_signed(value, bits, limbs)
            }
            ValueKind::BytesWrapper => match value.child_at(0) {
                Some(inner) => self.decode_byte_sequence(inner.as_ref()),
                None => self.decode_byte_sequence(value),
            },
            ValueKind::ByteSequence => self.decode_byte_sequence(value),
            ValueKind::Other => None,
        };
        if special.is_some() {
            return special;
        }

        meaningful(value.scalar())
            .or_else(|| meaningful(value.summary()))
            .or_else(|| self.decode_struct(value, &type_name, depth))
    }

    /// `FixedBytes<N>` をデコードする
    fn decode_fixed_bytes(&self, value: &dyn ValueView, len: usize) -> Option<String> {
        let bytes = read_exact(value, len)
            .or_else(|| value.child_at(0).and_then(|inner| read_exact(inner.as_ref(), len)))
            .or_else(|| collect_bytes(value, len))?;
        Some(to_hex(&bytes))
    }

    /// `Address` をデコードする
    ///
    /// `Address(FixedBytes<20>([u8; 20]))` の2段の包みをたどって20バイトを読む。
    fn decode_address(&self, value: &dyn ValueView) -> Option<String> {
        let bytes = value
            .child_at(0)
            .and_then(|fixed| {
                fixed
                    .child_at(0)
                    .and_then(|array| read_exact(array.as_ref(), ADDRESS_LEN))
                    .or_else(|| read_exact(fixed.as_ref(), ADDRESS_LEN))
            })
            .or_else(|| read_exact(value, ADDRESS_LEN))?;

        if bytes.iter().all(|b| *b == 0) {
            return Some(ZERO_ADDRESS.to_string());
        }
        Some(to_hex(&bytes))
    }

    /// リム配列を多倍長整数に積み上げる（リム0が最下位）
    fn read_limbs(&self, value: &dyn ValueView, bits: usize, limb_count: usize) -> Option<BigUint> {
        let limbs_value = value.child_named("limbs");
        let container: &dyn ValueView = match &limbs_value {
            Some(limbs) => limbs.as_ref(),
            None => value,
        };

        let limbs: Vec<u64> = match (0..limb_count)
            .map(|i| container.child_at(i).and_then(|limb| limb.as_u64()))
            .collect::<Option<Vec<_>>>()
        {
            Some(limbs) => limbs,
            None => {
                let raw = read_exact(container, limb_count.checked_mul(8)?)?;
                raw.chunks_exact(8)
                    .map(|chunk| chunk.try_into().ok().map(u64::from_le_bytes))
                    .collect::<Option<Vec<_>>>()?
            }
        };

        let mut acc = BigUint::zero();
        for (i, limb) in limbs.iter().enumerate() {
            acc |= BigUint::from(*limb) << (64 * i);
        }

        if bits > 0 {
            let mask = (BigUint::one() << bits) - BigUint::one();
            acc &= mask;
        }
        Some(acc)
    }

    /// `Signed<BITS, LIMBS>` をデコードする（2の補数）
    fn decode_signed(&self, value: &dyn ValueView, bits: usize, limbs: usize) -> Option<String> {
        let magnitude = match value.child_at(0) {
            Some(inner) => self.read_limbs(inner.as_ref(), bits, limbs)?,
            None => self.read_limbs(value, bits, limbs)?,
        };

        if bits == 0 || !magnitude.bit((bits - 1) as u64) {
            return Some(magnitude.to_string());
        }
        let signed = BigInt::from(magnitude) - (BigInt::one() << bits);
        Some(signed.to_string())
    }

    /// バイト列の子要素を連結して16進数にする
    ///
    /// `max_buffer_len` を超える分は読まず、末尾に `...` を付ける。
    fn decode_byte_sequence(&self, value: &dyn ValueView) -> Option<String> {
        let total = value.child_count();
        if total == 0 {
            return Some(UNAVAILABLE.to_string());
        }
        let count = total.min(self.config.max_buffer_len);
        let bytes = collect_bytes(value, count)?;
        let mut hex = to_hex(&bytes);
        if count < total {
            hex.push_str("...");
        }
        Some(hex)
    }

    /// 子フィールドを再帰的に展開する
    fn decode_struct(&self, value: &dyn ValueView, type_name: &str, depth: usize) -> Option<String> {
        let count = value.child_count();
        if count == 0 || depth >= self.config.max_depth {
            return None;
        }

        let fields: Vec<String> = (0..count)
            .map(|i| match value.child_at(i) {
                Some(child) => {
                    let name = child.name().unwrap_or_else(|| i.to_string());
                    format!("{}={}", name, self.decode_at(child.as_ref(), depth + 1))
                }
                None => format!("{}={}", i, UNAVAILABLE),
            })
            .collect();

        let type_name = if type_name.is_empty() {
            "<anonymous>"
        } else {
            type_name
        };
        Some(format!("{} {{ {} }}", type_name, fields.join(", ")))
    }
}

/// ちょうど `len` バイトを読む
fn read_exact(value: &dyn ValueView, len: usize) -> Option<Vec<u8>> {
    value.read_bytes(len).filter(|bytes| bytes.len() == len)
}

/// 子要素1つを1バイトとして読む（8ビットでマスク）
fn byte_of(child: &dyn ValueView) -> Option<u8> {
    if let Some(first) = child.read_bytes(1).and_then(|b| b.first().copied()) {
        return Some(first);
    }
    let scalar = child.scalar()?;
    let scalar = scalar.trim();
    let parsed = match scalar.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => scalar.parse::<i64>().ok()? as u64,
    };
    Some((parsed & 0xff) as u8)
}

/// 先頭 `count` 個の子要素をバイト列として集める
fn collect_bytes(value: &dyn ValueView, count: usize) -> Option<Vec<u8>> {
    if value.child_count() < count {
        return None;
    }
    (0..count)
        .map(|i| value.child_at(i).and_then(|child| byte_of(child.as_ref())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticValue;

    fn decoder() -> ValueDecoder {
        ValueDecoder::default()
    }

    fn limbs(type_name: &str, words: &[u64]) -> SyntheticValue {
        let limbs = SyntheticValue::array(
            "limbs",
            "[u64; 2]",
            words.iter().map(|w| SyntheticValue::u64_value("", *w)).collect(),
        );
        SyntheticValue::structure("value", type_name, vec![limbs])
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            ValueKind::classify("alloy_primitives::bits::fixed::FixedBytes<32>"),
            ValueKind::FixedBytes(32)
        );
        assert_eq!(
            ValueKind::classify("ruint::Uint<256, 4>"),
            ValueKind::Uint { bits: 256, limbs: 4 }
        );
        assert_eq!(
            ValueKind::classify("alloy_primitives::signed::int::Signed<128, 2>"),
            ValueKind::Signed { bits: 128, limbs: 2 }
        );
        assert_eq!(
            ValueKind::classify("alloy_primitives::bits::address::Address"),
            ValueKind::Address
        );
        assert_eq!(ValueKind::classify("&[u8]"), ValueKind::ByteSequence);
        assert_eq!(
            ValueKind::classify("alloc::vec::Vec<u8, alloc::alloc::Global>"),
            ValueKind::ByteSequence
        );
        assert_eq!(
            ValueKind::classify("alloc::vec::Vec<alloy_primitives::FixedBytes<32>>"),
            ValueKind::Other
        );
        assert_eq!(ValueKind::classify("alloc::vec::Vec<u16>"), ValueKind::Other);
        assert_eq!(
            ValueKind::classify("Vec<u8, alloc::alloc::Global>"),
            ValueKind::ByteSequence
        );
        assert_eq!(ValueKind::classify("Vec<u8>"), ValueKind::ByteSequence);
        assert_eq!(
            ValueKind::classify("Vec<alloc::vec::Vec<u8, alloc::alloc::Global>, alloc::alloc::Global>"),
            ValueKind::Other
        );
    }

    #[test]
    fn test_fixed_bytes() {
        let value = SyntheticValue::bytes("hash", "FixedBytes<4>", vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(decoder().decode(&value), "0xdeadbeef");
    }

    #[test]
    fn test_address_zero_and_nonzero() {
        let wrap = |bytes: Vec<u8>| {
            let array = SyntheticValue::bytes("0", "[u8; 20]", bytes);
            let fixed = SyntheticValue::structure("0", "FixedBytes<20>", vec![array]);
            SyntheticValue::structure("to", "alloy_primitives::bits::address::Address", vec![fixed])
        };
        assert_eq!(decoder().decode(&wrap(vec![0; 20])), "<zero address>");

        let mut bytes = vec![0u8; 20];
        bytes[19] = 0x01;
        assert_eq!(
            decoder().decode(&wrap(bytes)),
            "0x0000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_uint_limbs() {
        assert_eq!(decoder().decode(&limbs("ruint::Uint<128, 2>", &[1, 0])), "1");
        assert_eq!(
            decoder().decode(&limbs("ruint::Uint<128, 2>", &[u64::MAX, 0])),
            "18446744073709551615"
        );
        assert_eq!(
            decoder().decode(&limbs("ruint::Uint<128, 2>", &[0, 1])),
            "18446744073709551616"
        );
    }

    #[test]
    fn test_signed_limbs() {
        let signed = |words: &[u64]| {
            SyntheticValue::structure(
                "delta",
                "alloy_primitives::signed::int::Signed<128, 2>",
                vec![limbs("ruint::Uint<128, 2>", words)],
            )
        };
        assert_eq!(decoder().decode(&signed(&[5, 0])), "5");
        assert_eq!(decoder().decode(&signed(&[u64::MAX, u64::MAX])), "-1");
        assert_eq!(
            decoder().decode(&signed(&[0, 1 << 63])),
            "-170141183460469231731687303715884105728"
        );

        let unavailable = signed(&[5, 0]).unavailable();
        assert_eq!(decoder().decode(&unavailable), UNAVAILABLE);
    }

    #[test]
    fn test_byte_sequences() {
        let vec = SyntheticValue::byte_children("data", "alloc::vec::Vec<u8>", &[0x01, 0xab]);
        assert_eq!(decoder().decode(&vec), "0x01ab");

        // rustcのDWARFでは外側の型名が修飾されない
        let payload =
            SyntheticValue::byte_children("payload", "Vec<u8, alloc::alloc::Global>", &[0x68, 0x69]);
        assert_eq!(decoder().decode(&payload), "0x6869");

        let empty = SyntheticValue::byte_children("data", "&[u8]", &[]);
        assert_eq!(decoder().decode(&empty), UNAVAILABLE);

        let inner = SyntheticValue::byte_children("0", "bytes::bytes::Bytes", &[0xff]);
        let wrapper = SyntheticValue::structure("input", "alloy_primitives::bytes_::Bytes", vec![inner]);
        assert_eq!(decoder().decode(&wrapper), "0xff");
    }

    #[test]
    fn test_long_byte_sequence_is_marked_truncated() {
        let decoder = ValueDecoder::new(DecodeConfig {
            max_buffer_len: 2,
            ..DecodeConfig::default()
        });
        let long = SyntheticValue::byte_children("data", "&[u8]", &[0x01, 0x02, 0x03]);
        assert_eq!(decoder.decode(&long), "0x0102...");
        let exact = SyntheticValue::byte_children("data", "&[u8]", &[0x01, 0x02]);
        assert_eq!(decoder.decode(&exact), "0x0102");
    }

    #[test]
    fn test_out_of_range_widths_are_unavailable() {
        let huge = limbs("ruint::Uint<18446744073709551615, 1>", &[1]);
        assert_eq!(decoder().decode(&huge), UNAVAILABLE);

        let too_wide = limbs("ruint::Uint<129, 2>", &[1, 0]);
        assert_eq!(decoder().decode(&too_wide), UNAVAILABLE);

        let many_limbs = limbs("ruint::Uint<64, 100000>", &[1]);
        assert_eq!(decoder().decode(&many_limbs), UNAVAILABLE);

        let signed = SyntheticValue::structure(
            "delta",
            "Signed<99999, 1>",
            vec![limbs("ruint::Uint<64, 1>", &[1])],
        );
        assert_eq!(decoder().decode(&signed), UNAVAILABLE);

        let fixed = SyntheticValue::bytes("hash", "FixedBytes<18446744073709551615>", vec![0xaa]);
        assert_eq!(decoder().decode(&fixed), UNAVAILABLE);
    }

    #[test]
    fn test_scalar_and_summary_fallbacks() {
        let scalar = SyntheticValue::scalar("n", "i32", "42");
        assert_eq!(decoder().decode(&scalar), "42");

        let summary = SyntheticValue::leaf("s", "&str").with_summary("\"hi\"");
        assert_eq!(decoder().decode(&summary), "\"hi\"");

        let sentinel = SyntheticValue::scalar("n", "i32", UNAVAILABLE);
        assert_eq!(decoder().decode(&sentinel), UNAVAILABLE);
    }

    #[test]
    fn test_struct_recursion() {
        let point = SyntheticValue::structure(
            "p",
            "app::Point",
            vec![
                SyntheticValue::scalar("x", "i32", "1"),
                SyntheticValue::scalar("y", "i32", "2"),
            ],
        );
        assert_eq!(decoder().decode(&point), "app::Point { x=1, y=2 }");
    }

    #[test]
    fn test_struct_depth_limit() {
        let mut value = SyntheticValue::scalar("leaf", "i32", "7");
        for depth in 0..5 {
            value = SyntheticValue::structure(&format!("f{}", depth), "app::Node", vec![value]);
        }
        let rendered = decoder().decode(&value);
        assert!(rendered.contains(UNAVAILABLE));
        assert!(!rendered.contains('7'));
    }

    #[test]
    fn test_zero_handling() {
        let zero = SyntheticValue::scalar("n", "u64", "0");
        assert_eq!(decoder().decode(&zero), "0");

        let legacy = ValueDecoder::new(DecodeConfig {
            zero_as_unavailable: true,
            ..DecodeConfig::default()
        });
        assert_eq!(legacy.decode(&zero), UNAVAILABLE);
        assert_eq!(legacy.decode(&limbs("ruint::Uint<128, 2>", &[0, 0])), UNAVAILABLE);
    }

    #[test]
    fn test_rendered_scalar_is_stable() {
        for text in ["42", "-7", "0xdeadbeef", "\"quoted\"", "true"] {
            let value = SyntheticValue::scalar("v", "i64", text);
            let once = decoder().decode(&value);
            let again = decoder().decode(&SyntheticValue::scalar("v", "i64", &once));
            assert_eq!(once, text);
            assert_eq!(again, once);
        }
    }

    #[test]
    fn test_no_information_is_unavailable() {
        let value = SyntheticValue::leaf("x", "app::Opaque");
        assert_eq!(decoder().decode(&value), UNAVAILABLE);
    }
}
