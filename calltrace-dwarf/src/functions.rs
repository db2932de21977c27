//! 関数DIEの索引
//!
//! 全コンパイルユニットの `DW_TAG_subprogram` を一度だけ走査し、
//! アドレス範囲で引ける索引を作ります。

use crate::symbols::demangle_symbol;
use crate::{DwarfLoader, DwarfReader, Result};

/// 関数1つ分の情報
#[derive(Debug, Clone)]
pub struct FunctionEntry {
    /// 完全修飾名（デマングル済み、ハッシュなし）
    pub name: String,
    /// 開始アドレス（ファイル上）
    pub low_pc: u64,
    /// 終了アドレス（含まない）
    pub high_pc: u64,
    /// 所属するユニットのインデックス
    pub unit_index: usize,
    /// ユニット内のDIEオフセット
    pub offset: gimli::UnitOffset,
}

impl FunctionEntry {
    /// アドレスが関数の範囲内か
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.low_pc && pc < self.high_pc
    }
}

/// DWARFのユニットと関数索引
pub struct DebugInfo {
    dwarf: gimli::Dwarf<DwarfReader>,
    units: Vec<gimli::Unit<DwarfReader>>,
    /// low_pc順
    functions: Vec<FunctionEntry>,
}

impl DebugInfo {
    /// ローダーから索引を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.load_dwarf()?;
        let mut units = Vec::new();
        let mut functions = Vec::new();

        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let unit = dwarf.unit(header)?;
            let unit_index = units.len();
            collect_functions(&dwarf, &unit, unit_index, &mut functions)?;
            units.push(unit);
        }

        functions.sort_by_key(|f| f.low_pc);
        tracing::debug!(
            units = units.len(),
            functions = functions.len(),
            "indexed debug info"
        );

        Ok(Self {
            dwarf,
            units,
            functions,
        })
    }

    /// DWARFコンテキスト
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// 関数が所属するユニット
    pub fn unit(&self, function: &FunctionEntry) -> Option<&gimli::Unit<DwarfReader>> {
        self.units.get(function.unit_index)
    }

    /// すべての関数
    pub fn functions(&self) -> &[FunctionEntry] {
        &self.functions
    }

    /// アドレスを含む関数を探す
    pub fn function_at(&self, pc: u64) -> Option<&FunctionEntry> {
        let idx = self.functions.partition_point(|f| f.low_pc <= pc);
        self.functions[..idx].iter().rev().find(|f| f.contains(pc))
    }

    /// 開始アドレスが一致する関数を探す
    pub fn function_starting_at(&self, low_pc: u64) -> Option<&FunctionEntry> {
        let idx = self.functions.partition_point(|f| f.low_pc < low_pc);
        self.functions.get(idx).filter(|f| f.low_pc == low_pc)
    }
}

/// ユニット内の関数を集める
fn collect_functions(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    unit_index: usize,
    out: &mut Vec<FunctionEntry>,
) -> Result<()> {
    // 名前空間の入れ子（深さ, 名前）
    let mut namespaces: Vec<(isize, String)> = Vec::new();
    let mut depth = 0isize;

    let mut entries = unit.entries();
    while let Some((delta, entry)) = entries.next_dfs()? {
        depth += delta;
        while namespaces.last().is_some_and(|(d, _)| *d >= depth) {
            namespaces.pop();
        }

        match entry.tag() {
            gimli::DW_TAG_namespace
            | gimli::DW_TAG_structure_type
            | gimli::DW_TAG_enumeration_type
            | gimli::DW_TAG_union_type => {
                if let Some(name) = entry_name(dwarf, unit, entry, gimli::DW_AT_name) {
                    namespaces.push((depth, name));
                }
            }
            gimli::DW_TAG_subprogram => {
                if entry.attr_value(gimli::DW_AT_declaration)?.is_some() {
                    continue;
                }
                let Some((low_pc, high_pc)) = function_range(dwarf, unit, entry)? else {
                    continue;
                };
                let Some(name) = function_name(dwarf, unit, entry, &namespaces) else {
                    continue;
                };
                out.push(FunctionEntry {
                    name,
                    low_pc,
                    high_pc,
                    unit_index,
                    offset: entry.offset(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// 関数のアドレス範囲（複数ある場合は開始アドレスを含む範囲）
fn function_range(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    entry: &gimli::DebuggingInformationEntry<DwarfReader>,
) -> Result<Option<(u64, u64)>> {
    let mut ranges = dwarf.die_ranges(unit, entry)?;
    let mut best: Option<(u64, u64)> = None;
    while let Some(range) = ranges.next()? {
        if range.begin == 0 || range.begin >= range.end {
            continue;
        }
        if best.map_or(true, |(low, _)| range.begin < low) {
            best = Some((range.begin, range.end));
        }
    }
    Ok(best)
}

/// 関数名を決める
///
/// リンケージ名があればデマングルして使う。なければ名前空間と `DW_AT_name` から組み立てる。
/// 宣言（`DW_AT_specification`）や抽象インスタンス（`DW_AT_abstract_origin`）も参照する。
fn function_name(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    entry: &gimli::DebuggingInformationEntry<DwarfReader>,
    namespaces: &[(isize, String)],
) -> Option<String> {
    let linkage = entry_name(dwarf, unit, entry, gimli::DW_AT_linkage_name)
        .or_else(|| entry_name(dwarf, unit, entry, gimli::DW_AT_MIPS_linkage_name));
    if let Some(linkage) = linkage {
        return Some(demangle_symbol(&linkage));
    }

    if let Some(name) = entry_name(dwarf, unit, entry, gimli::DW_AT_name) {
        let mut path: Vec<&str> = namespaces.iter().map(|(_, n)| n.as_str()).collect();
        path.push(&name);
        return Some(path.join("::"));
    }

    for origin in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
        if let Ok(Some(gimli::AttributeValue::UnitRef(offset))) = entry.attr_value(origin) {
            if let Ok(declaration) = unit.entry(offset) {
                if let Some(name) = function_name(dwarf, unit, &declaration, namespaces) {
                    return Some(name);
                }
            }
        }
    }
    None
}

/// 文字列属性を読む
pub(crate) fn entry_name(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    entry: &gimli::DebuggingInformationEntry<DwarfReader>,
    attr: gimli::DwAt,
) -> Option<String> {
    let value = entry.attr_value(attr).ok()??;
    let name = dwarf.attr_string(unit, value).ok()?;
    Some(name.to_string_lossy().into_owned())
}
