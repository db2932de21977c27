//! DWARFの型情報で解釈した値
//!
//! エンジンの `ValueView` を実装します。参照と `Box` は透過的にたどり、
//! `&str`・`String` は引用符付きの要約文字列、スライスと `Vec` は
//! `[i]` という名前の要素を子として見せます。

use calltrace_dwarf::{
    format_primitive, read_signed, read_unsigned, EnumVariant, MemoryReader, PrimitiveEncoding,
    TypeInfo, TypeKind,
};
use calltrace_engine::naming::{generic_args, last_segment};
use calltrace_engine::ValueView;
use std::cell::OnceCell;

/// 参照をたどる最大回数
const MAX_DEREF: usize = 4;

/// 文字列の要約として読む最大バイト数
const MAX_STRING_LEN: usize = 256;

/// バイト列の要素として見せる最大数
const MAX_BYTE_ELEMENTS: usize = 1 << 16;

/// バイト以外の配列・スライス要素として見せる最大数
const MAX_ELEMENTS: usize = 256;

/// ポインタのバイト数
const POINTER_SIZE: usize = 8;

/// ヒープ上の連続した要素列
#[derive(Debug, Clone)]
struct Sequence {
    ptr: u64,
    len: usize,
    element: TypeInfo,
}

/// デバッグ対象の値1つ
pub struct DwarfValue<'m> {
    name: Option<String>,
    type_info: TypeInfo,
    /// 値のバイト列（読めなければ `None`）
    bytes: Option<Vec<u8>>,
    /// メモリ上にある値ならそのアドレス
    address: Option<u64>,
    memory: &'m dyn MemoryReader,
    sequence: Option<Sequence>,
    /// 要素列の中身（最初に子要素を読むときに一度だけ読む）
    elements: OnceCell<Option<Vec<u8>>>,
}

impl<'m> DwarfValue<'m> {
    /// 値を作成する
    ///
    /// 参照型ならここで参照先まで読み進める。
    pub fn new(
        name: Option<String>,
        type_info: TypeInfo,
        bytes: Option<Vec<u8>>,
        address: Option<u64>,
        memory: &'m dyn MemoryReader,
    ) -> Self {
        let (type_info, bytes, address) = deref(type_info, bytes, address, memory);
        let sequence = bytes
            .as_deref()
            .and_then(|bytes| sequence_of(&type_info, bytes));
        Self {
            name,
            type_info,
            bytes,
            address,
            memory,
            sequence,
            elements: OnceCell::new(),
        }
    }

    /// 読み取れなかった値を作成する
    pub fn unavailable(name: Option<String>, type_info: TypeInfo, memory: &'m dyn MemoryReader) -> Self {
        Self::new(name, type_info, None, None, memory)
    }

    /// 型情報
    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    /// 値のアドレス
    pub fn address(&self) -> Option<u64> {
        self.address
    }

    /// 判別値から現在のvariantを選ぶ
    fn active_variant(&self) -> Option<&EnumVariant> {
        let TypeKind::Enum { discriminant, variants } = &self.type_info.kind else {
            return None;
        };
        match discriminant {
            Some(discr) => {
                let bytes = self.bytes.as_deref()?;
                let raw = bytes.get(discr.offset as usize..)?;
                let value = read_unsigned(raw, discr.type_info.size as usize)?;
                self.type_info.variant_for(value)
            }
            // variantが1つだけの列挙型は判別値を持たない
            None => variants.first(),
        }
    }

    /// `offset` の位置にある子の値を作る
    fn child(&self, name: String, type_info: &TypeInfo, offset: u64) -> DwarfValue<'m> {
        let bytes = self
            .bytes
            .as_deref()
            .and_then(|bytes| slice_at(bytes, offset, type_info.size));
        let address = self.address.and_then(|addr| addr.checked_add(offset));
        DwarfValue::new(Some(name), type_info.clone(), bytes, address, self.memory)
    }

    /// 要素列の `index` 番目
    ///
    /// アドレス計算があふれる要素は読めない値になる。
    fn element(&self, sequence: &Sequence, index: usize) -> DwarfValue<'m> {
        let name = Some(format!("[{}]", index));
        let size = sequence.element.size;
        let address = (index as u64)
            .checked_mul(size)
            .and_then(|offset| sequence.ptr.checked_add(offset).map(|addr| (offset, addr)));
        let Some((offset, address)) = address else {
            return DwarfValue::unavailable(name, sequence.element.clone(), self.memory);
        };
        let buffer = self.elements.get_or_init(|| {
            let total = usize::try_from(size)
                .ok()
                .and_then(|size| sequence_count(sequence).checked_mul(size))?;
            sequence.ptr.checked_add(total as u64)?;
            self.memory.read(sequence.ptr, total).ok()
        });
        let bytes = buffer
            .as_deref()
            .and_then(|buffer| slice_at(buffer, offset, size));
        DwarfValue::new(name, sequence.element.clone(), bytes, Some(address), self.memory)
    }

    /// 文字列型なら (データへのポインタ, 長さ)
    fn string_parts(&self) -> Option<(u64, usize)> {
        let bytes = self.bytes.as_deref()?;
        let name = self.type_info.name.as_str();
        match name {
            "&str" | "&mut str" => slice_parts(&self.type_info, bytes),
            // DWARFでは `String` と修飾なしで出ることもある
            _ if last_segment(name) == "String" => {
                let vec = self.type_info.field("vec")?;
                let (ptr, len, _) = vec_parts(&vec.type_info, bytes.get(vec.offset as usize..)?)?;
                Some((ptr, len))
            }
            _ => None,
        }
    }
}

impl ValueView for DwarfValue<'_> {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn type_name(&self) -> Option<String> {
        if let Some(variant) = self.active_variant() {
            return Some(format!("{}::{}", self.type_info.name, variant.name));
        }
        Some(self.type_info.name.clone()).filter(|name| !name.is_empty())
    }

    fn scalar(&self) -> Option<String> {
        let bytes = self.bytes.as_deref()?;
        let size = self.type_info.size;
        match &self.type_info.kind {
            TypeKind::Primitive(encoding) => format_primitive(bytes, *encoding, size),
            TypeKind::Pointer { .. } => {
                read_unsigned(bytes, POINTER_SIZE).map(|ptr| format!("0x{:x}", ptr))
            }
            TypeKind::Enumeration { enumerators } => {
                let signed = read_signed(bytes, size as usize)?;
                let unsigned = read_unsigned(bytes, size as usize)? as i64;
                let name = enumerators
                    .iter()
                    .find(|(_, value)| *value == signed || *value == unsigned)
                    .map(|(name, _)| format!("{}::{}", self.type_info.name, name));
                Some(name.unwrap_or_else(|| signed.to_string()))
            }
            TypeKind::Enum { .. } => {
                let variant = self.active_variant()?;
                variant
                    .payload
                    .fields()
                    .is_empty()
                    .then(|| format!("{}::{}", self.type_info.name, variant.name))
            }
            _ => None,
        }
    }

    fn summary(&self) -> Option<String> {
        let (ptr, len) = self.string_parts()?;
        if len == 0 {
            return Some("\"\"".to_string());
        }
        let shown = len.min(MAX_STRING_LEN);
        let raw = self.memory.read(ptr, shown).ok()?;
        let text = String::from_utf8_lossy(&raw);
        if shown < len {
            Some(format!("{:?}...", text))
        } else {
            Some(format!("{:?}", text))
        }
    }

    fn is_available(&self) -> bool {
        self.bytes.is_some()
    }

    fn child_count(&self) -> usize {
        if self.bytes.is_none() {
            return 0;
        }
        if let Some(sequence) = &self.sequence {
            return sequence_count(sequence);
        }
        match &self.type_info.kind {
            TypeKind::Struct { fields } | TypeKind::Union { fields } => fields.len(),
            TypeKind::Array { element, length } => match (element, length) {
                (Some(_), Some(length)) => (*length as usize).min(MAX_ELEMENTS),
                _ => 0,
            },
            TypeKind::Enum { .. } => self
                .active_variant()
                .map(|variant| variant.payload.fields().len())
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn child_at(&self, index: usize) -> Option<Box<dyn ValueView + '_>> {
        if index >= self.child_count() {
            return None;
        }
        if let Some(sequence) = &self.sequence {
            return Some(Box::new(self.element(sequence, index)));
        }
        let child = match &self.type_info.kind {
            TypeKind::Struct { fields } | TypeKind::Union { fields } => {
                let field = fields.get(index)?;
                self.child(field.name.clone(), &field.type_info, field.offset)
            }
            TypeKind::Array { element, .. } => {
                let element = element.as_deref()?;
                self.child(format!("[{}]", index), element, index as u64 * element.size)
            }
            TypeKind::Enum { .. } => {
                let variant = self.active_variant()?;
                let field = variant.payload.fields().get(index)?;
                self.child(field.name.clone(), &field.type_info, variant.offset + field.offset)
            }
            _ => return None,
        };
        Some(Box::new(child))
    }

    fn read_bytes(&self, len: usize) -> Option<Vec<u8>> {
        let bytes = self.bytes.as_ref()?;
        if len <= bytes.len() {
            return Some(bytes[..len].to_vec());
        }
        if len > MAX_BYTE_ELEMENTS {
            return None;
        }
        let address = self.address?;
        address.checked_add(len as u64)?;
        self.memory.read(address, len).ok()
    }
}

/// 透過的にたどるポインタ型か（参照と `Box`）
fn is_transparent_pointer(type_info: &TypeInfo) -> bool {
    type_info.is_reference()
        || (matches!(type_info.kind, TypeKind::Pointer { .. })
            && last_segment(&type_info.name).starts_with("Box<"))
}

/// 参照を参照先の値に置き換える
///
/// ヌルポインタや読めない参照先ではそこで止める。
fn deref(
    mut type_info: TypeInfo,
    mut bytes: Option<Vec<u8>>,
    mut address: Option<u64>,
    memory: &dyn MemoryReader,
) -> (TypeInfo, Option<Vec<u8>>, Option<u64>) {
    for _ in 0..MAX_DEREF {
        if !is_transparent_pointer(&type_info) {
            break;
        }
        let Some(pointee) = type_info.pointee().cloned() else {
            break;
        };
        let Some(ptr) = bytes.as_deref().and_then(|b| read_unsigned(b, POINTER_SIZE)) else {
            break;
        };
        if ptr == 0 {
            break;
        }
        bytes = if pointee.size == 0 {
            Some(Vec::new())
        } else {
            memory.read(ptr, pointee.size as usize).ok()
        };
        address = Some(ptr);
        type_info = pointee;
    }
    (type_info, bytes, address)
}

/// `offset` から `size` バイトを切り出す
fn slice_at(bytes: &[u8], offset: u64, size: u64) -> Option<Vec<u8>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(size).ok()?)?;
    bytes.get(start..end).map(<[u8]>::to_vec)
}

/// フィールドを符号なし整数として読む
fn read_field(type_info: &TypeInfo, bytes: &[u8], name: &str) -> Option<u64> {
    let field = type_info.field(name)?;
    read_unsigned(bytes.get(field.offset as usize..)?, field.type_info.size as usize)
}

/// `&[T]` / `&str` の (data_ptr, length)
fn slice_parts(type_info: &TypeInfo, bytes: &[u8]) -> Option<(u64, usize)> {
    let ptr = read_field(type_info, bytes, "data_ptr")?;
    let len = read_field(type_info, bytes, "length")?;
    Some((ptr, usize::try_from(len).ok()?))
}

/// 構造体を深さ優先でたどり、最初のポインタの値と型を返す
fn first_pointer<'t>(type_info: &'t TypeInfo, bytes: &[u8], offset: u64) -> Option<(u64, &'t TypeInfo)> {
    match &type_info.kind {
        TypeKind::Pointer { .. } => {
            let ptr = read_unsigned(bytes.get(offset as usize..)?, POINTER_SIZE)?;
            Some((ptr, type_info))
        }
        TypeKind::Struct { fields } => fields
            .iter()
            .find_map(|field| first_pointer(&field.type_info, bytes, offset + field.offset)),
        _ => None,
    }
}

/// `Vec<T>` の (データへのポインタ, 長さ, ポインタ型)
///
/// `buf` の内部構造はコンパイラのバージョンで変わるので、最初に現れるポインタを使う。
fn vec_parts<'t>(type_info: &'t TypeInfo, bytes: &[u8]) -> Option<(u64, usize, &'t TypeInfo)> {
    let len = read_field(type_info, bytes, "len")?;
    let buf = type_info.field("buf")?;
    let (ptr, pointer_type) = first_pointer(&buf.type_info, bytes, buf.offset)?;
    Some((ptr, usize::try_from(len).ok()?, pointer_type))
}

/// `Vec<T, A>` の `T` の部分（パスの修飾は問わない）
fn vec_element_name(name: &str) -> Option<&str> {
    generic_args(last_segment(name), "Vec")?.first().copied()
}

fn u8_type() -> TypeInfo {
    TypeInfo {
        name: "u8".to_string(),
        size: 1,
        kind: TypeKind::Primitive(PrimitiveEncoding::Unsigned),
    }
}

/// スライスまたは `Vec` なら要素列として解釈する
fn sequence_of(type_info: &TypeInfo, bytes: &[u8]) -> Option<Sequence> {
    let name = type_info.name.as_str();
    if name.starts_with("&[") || name.starts_with("&mut [") {
        let (ptr, len) = slice_parts(type_info, bytes)?;
        let element = type_info
            .field("data_ptr")
            .and_then(|field| field.type_info.pointee())
            .cloned()
            .unwrap_or_else(|| TypeInfo::unknown(""));
        return Some(Sequence { ptr, len, element });
    }

    let element_name = vec_element_name(name)?;
    let (ptr, len, pointer_type) = vec_parts(type_info, bytes)?;
    // 新しいコンパイラでは `buf` のポインタが `u8` に型消去されている
    let element = match pointer_type.pointee() {
        Some(pointee) if last_segment(&pointee.name) == last_segment(element_name) => {
            pointee.clone()
        }
        _ if element_name == "u8" => u8_type(),
        _ => return None,
    };
    Some(Sequence { ptr, len, element })
}

/// 子として見せる要素数
fn sequence_count(sequence: &Sequence) -> usize {
    let limit = if sequence.element.size == 1 {
        MAX_BYTE_ELEMENTS
    } else {
        MAX_ELEMENTS
    };
    sequence.len.min(limit)
}
