//! DWARF型情報の抽出
//!
//! DWARF DIEから型情報（構造体フィールド、列挙型variant等）を抽出します。
//! 自己参照する型があるため、入れ子の深さには上限を設けます。

use crate::functions::entry_name;
use crate::{DwarfReader, Result};

/// 既定の入れ子上限
pub const DEFAULT_TYPE_DEPTH: usize = 8;

/// 基本型のエンコーディング
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveEncoding {
    Signed,
    Unsigned,
    Float,
    Boolean,
    Char,
    Other,
}

/// 型情報
#[derive(Debug, Clone, PartialEq)]
pub struct TypeInfo {
    /// 型名（`&str`、`alloc::vec::Vec<u8, alloc::alloc::Global>` など）
    pub name: String,
    /// バイトサイズ
    pub size: u64,
    pub kind: TypeKind,
}

/// 型の種類
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// 基本型
    Primitive(PrimitiveEncoding),
    /// ポインタ型（参照を含む）
    Pointer { pointee: Option<Box<TypeInfo>> },
    /// 配列型
    Array {
        element: Option<Box<TypeInfo>>,
        length: Option<u64>,
    },
    /// 構造体型
    Struct { fields: Vec<FieldInfo> },
    /// C風の列挙型
    Enumeration { enumerators: Vec<(String, i64)> },
    /// データを持つ列挙型（`DW_TAG_variant_part`）
    Enum {
        discriminant: Option<Box<FieldInfo>>,
        variants: Vec<EnumVariant>,
    },
    /// Union型
    Union { fields: Vec<FieldInfo> },
    /// 不明な型、または深さ上限に達した型
    Unknown,
}

/// フィールド情報
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// フィールド名
    pub name: String,
    /// オフセット（バイト）
    pub offset: u64,
    /// 型情報
    pub type_info: TypeInfo,
}

/// 列挙型のvariant
#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    /// Variant名
    pub name: String,
    /// 判別値（なければ既定のvariant）
    pub discr_value: Option<u64>,
    /// ペイロードのオフセット
    pub offset: u64,
    /// ペイロード（フィールドを持つ構造体）
    pub payload: TypeInfo,
}

impl TypeInfo {
    /// 不明な型
    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: TypeKind::Unknown,
        }
    }

    /// 参照型（`&T` / `&mut T`）か
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer { .. }) && self.name.starts_with('&')
    }

    /// 参照先の型
    pub fn pointee(&self) -> Option<&TypeInfo> {
        match &self.kind {
            TypeKind::Pointer { pointee } => pointee.as_deref(),
            _ => None,
        }
    }

    /// 構造体・Unionのフィールド
    pub fn fields(&self) -> &[FieldInfo] {
        match &self.kind {
            TypeKind::Struct { fields } | TypeKind::Union { fields } => fields,
            _ => &[],
        }
    }

    /// 名前でフィールドを探す
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// 判別値に対応するvariantを選ぶ
    ///
    /// 一致するものがなければ判別値を持たないvariantを返す。
    pub fn variant_for(&self, discr: u64) -> Option<&EnumVariant> {
        let TypeKind::Enum { variants, .. } = &self.kind else {
            return None;
        };
        variants
            .iter()
            .find(|v| v.discr_value == Some(discr))
            .or_else(|| variants.iter().find(|v| v.discr_value.is_none()))
    }
}

/// 型情報抽出器
pub struct TypeInfoExtractor<'a> {
    dwarf: &'a gimli::Dwarf<DwarfReader>,
    unit: &'a gimli::Unit<DwarfReader>,
    max_depth: usize,
}

impl<'a> TypeInfoExtractor<'a> {
    /// 新しい型情報抽出器を作成する
    pub fn new(dwarf: &'a gimli::Dwarf<DwarfReader>, unit: &'a gimli::Unit<DwarfReader>) -> Self {
        Self {
            dwarf,
            unit,
            max_depth: DEFAULT_TYPE_DEPTH,
        }
    }

    /// 入れ子の上限を変更する
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// DIEの `DW_AT_type` が指す型を抽出する
    pub fn type_of(&self, entry: &gimli::DebuggingInformationEntry<DwarfReader>) -> Result<TypeInfo> {
        match type_ref(entry) {
            Some(offset) => self.extract_type_info(offset),
            None => Ok(TypeInfo::unknown("<unknown>")),
        }
    }

    /// 型DIEから型情報を抽出する
    pub fn extract_type_info(&self, type_offset: gimli::UnitOffset) -> Result<TypeInfo> {
        self.extract_at(type_offset, 0)
    }

    fn extract_at(&self, type_offset: gimli::UnitOffset, depth: usize) -> Result<TypeInfo> {
        let entry = self.unit.entry(type_offset)?;
        let name = self.name(&entry);
        if depth >= self.max_depth {
            return Ok(TypeInfo::unknown(name.unwrap_or_else(|| "<...>".to_string())));
        }

        let size = byte_size(&entry);
        let info = match entry.tag() {
            gimli::DW_TAG_base_type => TypeInfo {
                name: name.unwrap_or_else(|| "<unknown>".to_string()),
                size: size.unwrap_or(0),
                kind: TypeKind::Primitive(encoding_of(&entry)),
            },
            gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
                let pointee = self.child_type(&entry, depth)?;
                let name = name.unwrap_or_else(|| {
                    let target = pointee.as_ref().map_or("void", |p| p.name.as_str());
                    format!("*const {}", target)
                });
                TypeInfo {
                    name,
                    size: size.unwrap_or(8),
                    kind: TypeKind::Pointer {
                        pointee: pointee.map(Box::new),
                    },
                }
            }
            gimli::DW_TAG_array_type => self.extract_array(&entry, name, size, depth)?,
            gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => {
                let name = name.unwrap_or_else(|| "<anonymous>".to_string());
                self.extract_struct(&entry, name, size.unwrap_or(0), depth)?
            }
            gimli::DW_TAG_union_type => TypeInfo {
                name: name.unwrap_or_else(|| "<anonymous>".to_string()),
                size: size.unwrap_or(0),
                kind: TypeKind::Union {
                    fields: self.extract_fields(&entry, depth)?,
                },
            },
            gimli::DW_TAG_enumeration_type => TypeInfo {
                name: name.unwrap_or_else(|| "<anonymous>".to_string()),
                size: size.unwrap_or(0),
                kind: TypeKind::Enumeration {
                    enumerators: self.extract_enumerators(&entry)?,
                },
            },
            gimli::DW_TAG_typedef
            | gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type
            | gimli::DW_TAG_atomic_type => match self.child_type(&entry, depth)? {
                Some(mut inner) => {
                    if entry.tag() == gimli::DW_TAG_typedef {
                        if let Some(name) = name {
                            inner.name = name;
                        }
                    }
                    inner
                }
                None => TypeInfo::unknown(name.unwrap_or_else(|| "<unknown>".to_string())),
            },
            gimli::DW_TAG_subroutine_type => TypeInfo {
                name: name.unwrap_or_else(|| "fn".to_string()),
                size: size.unwrap_or(8),
                kind: TypeKind::Unknown,
            },
            _ => TypeInfo::unknown(name.unwrap_or_else(|| "<unknown>".to_string())),
        };
        Ok(info)
    }

    /// `DW_AT_type` が指す型（なければ `None`）
    fn child_type(
        &self,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
        depth: usize,
    ) -> Result<Option<TypeInfo>> {
        match type_ref(entry) {
            Some(offset) => Ok(Some(self.extract_at(offset, depth + 1)?)),
            None => Ok(None),
        }
    }

    /// 配列型を抽出する
    fn extract_array(
        &self,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
        name: Option<String>,
        size: Option<u64>,
        depth: usize,
    ) -> Result<TypeInfo> {
        let element = self.child_type(entry, depth)?;

        let mut length = None;
        let mut tree = self.unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let child = child.entry();
            if child.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            length = attr_udata(child, gimli::DW_AT_count).or_else(|| {
                attr_udata(child, gimli::DW_AT_upper_bound).map(|upper| upper + 1)
            });
            break;
        }

        let element_size = element.as_ref().map_or(0, |e| e.size);
        let name = name.unwrap_or_else(|| {
            let element_name = element.as_ref().map_or("?", |e| e.name.as_str());
            match length {
                Some(len) => format!("[{}; {}]", element_name, len),
                None => format!("[{}]", element_name),
            }
        });
        Ok(TypeInfo {
            name,
            size: size.unwrap_or_else(|| element_size * length.unwrap_or(0)),
            kind: TypeKind::Array {
                element: element.map(Box::new),
                length,
            },
        })
    }

    /// 構造体型を抽出する（`DW_TAG_variant_part` を持てばデータ付き列挙型）
    fn extract_struct(
        &self,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
        name: String,
        size: u64,
        depth: usize,
    ) -> Result<TypeInfo> {
        let mut fields = Vec::new();
        let mut variant_part = None;

        let mut tree = self.unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            match child.entry().tag() {
                gimli::DW_TAG_member => {
                    if child.entry().attr_value(gimli::DW_AT_external)?.is_some() {
                        continue;
                    }
                    fields.push(self.extract_field(child.entry(), depth)?);
                }
                gimli::DW_TAG_variant_part => {
                    variant_part = Some(self.extract_variant_part(child, depth)?);
                }
                _ => {}
            }
        }

        let kind = match variant_part {
            Some((discriminant, variants)) => TypeKind::Enum {
                discriminant,
                variants,
            },
            None => TypeKind::Struct { fields },
        };
        Ok(TypeInfo { name, size, kind })
    }

    /// `DW_TAG_variant_part` から判別子とvariantを抽出する
    fn extract_variant_part(
        &self,
        node: gimli::EntriesTreeNode<DwarfReader>,
        depth: usize,
    ) -> Result<(Option<Box<FieldInfo>>, Vec<EnumVariant>)> {
        let discr_offset = match node.entry().attr_value(gimli::DW_AT_discr)? {
            Some(gimli::AttributeValue::UnitRef(offset)) => Some(offset),
            _ => None,
        };

        let mut discriminant = None;
        let mut variants = Vec::new();
        let mut children = node.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            match entry.tag() {
                gimli::DW_TAG_member if Some(entry.offset()) == discr_offset => {
                    discriminant = Some(Box::new(self.extract_field(entry, depth)?));
                }
                gimli::DW_TAG_variant => {
                    let discr_value = attr_udata(entry, gimli::DW_AT_discr_value);
                    let mut members = child.children();
                    if let Some(member) = members.next()? {
                        let member = member.entry();
                        if member.tag() == gimli::DW_TAG_member {
                            let field = self.extract_field(member, depth)?;
                            variants.push(EnumVariant {
                                name: field.name,
                                discr_value,
                                offset: field.offset,
                                payload: field.type_info,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok((discriminant, variants))
    }

    /// 構造体・Unionのメンバを抽出する
    fn extract_fields(
        &self,
        parent: &gimli::DebuggingInformationEntry<DwarfReader>,
        depth: usize,
    ) -> Result<Vec<FieldInfo>> {
        let mut fields = Vec::new();
        let mut tree = self.unit.entries_tree(Some(parent.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            if child.entry().tag() == gimli::DW_TAG_member {
                fields.push(self.extract_field(child.entry(), depth)?);
            }
        }
        Ok(fields)
    }

    /// フィールド情報を抽出する
    fn extract_field(
        &self,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
        depth: usize,
    ) -> Result<FieldInfo> {
        let name = self.name(entry).unwrap_or_else(|| "<unnamed>".to_string());
        let offset = attr_udata(entry, gimli::DW_AT_data_member_location).unwrap_or(0);
        let type_info = self
            .child_type(entry, depth)?
            .unwrap_or_else(|| TypeInfo::unknown("<unknown>"));
        Ok(FieldInfo {
            name,
            offset,
            type_info,
        })
    }

    /// C風列挙型の列挙子を抽出する
    fn extract_enumerators(
        &self,
        parent: &gimli::DebuggingInformationEntry<DwarfReader>,
    ) -> Result<Vec<(String, i64)>> {
        let mut enumerators = Vec::new();
        let mut tree = self.unit.entries_tree(Some(parent.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_enumerator {
                continue;
            }
            let value = entry
                .attr_value(gimli::DW_AT_const_value)?
                .and_then(|v| v.sdata_value().or_else(|| v.udata_value().map(|u| u as i64)));
            if let (Some(name), Some(value)) = (self.name(entry), value) {
                enumerators.push((name, value));
            }
        }
        Ok(enumerators)
    }

    fn name(&self, entry: &gimli::DebuggingInformationEntry<DwarfReader>) -> Option<String> {
        entry_name(self.dwarf, self.unit, entry, gimli::DW_AT_name)
    }
}

/// 型参照を取得する
fn type_ref(entry: &gimli::DebuggingInformationEntry<DwarfReader>) -> Option<gimli::UnitOffset> {
    match entry.attr_value(gimli::DW_AT_type).ok()?? {
        gimli::AttributeValue::UnitRef(offset) => Some(offset),
        _ => None,
    }
}

/// バイトサイズを取得する
fn byte_size(entry: &gimli::DebuggingInformationEntry<DwarfReader>) -> Option<u64> {
    attr_udata(entry, gimli::DW_AT_byte_size)
}

fn attr_udata(entry: &gimli::DebuggingInformationEntry<DwarfReader>, attr: gimli::DwAt) -> Option<u64> {
    entry.attr_value(attr).ok()??.udata_value()
}

fn encoding_of(entry: &gimli::DebuggingInformationEntry<DwarfReader>) -> PrimitiveEncoding {
    match entry.attr_value(gimli::DW_AT_encoding) {
        Ok(Some(gimli::AttributeValue::Encoding(encoding))) => match encoding {
            gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => PrimitiveEncoding::Signed,
            gimli::DW_ATE_unsigned | gimli::DW_ATE_unsigned_char => PrimitiveEncoding::Unsigned,
            gimli::DW_ATE_float => PrimitiveEncoding::Float,
            gimli::DW_ATE_boolean => PrimitiveEncoding::Boolean,
            gimli::DW_ATE_UTF => PrimitiveEncoding::Char,
            _ => PrimitiveEncoding::Other,
        },
        _ => PrimitiveEncoding::Other,
    }
}
