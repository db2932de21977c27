//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（ハッシュなし）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// アドレスがシンボルの範囲内か
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address.saturating_add(self.size.max(1))
    }
}

/// シンボル名をデマングルする
///
/// `{:#}` で末尾のハッシュを落とす。Rust以外の名前はそのまま返す。
pub fn demangle_symbol(name: &str) -> String {
    match rustc_demangle::try_demangle(name) {
        Ok(demangled) => format!("{:#}", demangled),
        Err(_) => name.to_string(),
    }
}

/// コードシンボルだけを取り出す
fn text_symbol<'data>(symbol: object::Symbol<'data, '_>) -> Option<Symbol> {
    if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
        return None;
    }
    let name = symbol.name().ok().filter(|n| !n.is_empty())?;
    Some(Symbol::new(name.to_string(), symbol.address(), symbol.size()))
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// コードシンボル（アドレス順）
    functions: Vec<Symbol>,
    /// PIE（Position Independent Executable）かどうか
    is_pie: bool,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let object_file = loader.object_file();
        let mut symbols: Vec<Symbol> = object_file.symbols().filter_map(text_symbol).collect();
        // strip済みの共有ライブラリは動的シンボルだけを持つ
        if symbols.is_empty() {
            symbols = object_file.dynamic_symbols().filter_map(text_symbol).collect();
        }
        Ok(Self::from_symbols(symbols, loader.is_pie()))
    }

    /// シンボル列から作成する
    pub fn from_symbols(symbols: impl IntoIterator<Item = Symbol>, is_pie: bool) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut functions = Vec::new();
        for symbol in symbols {
            symbols_by_name.insert(symbol.name.clone(), symbol.clone());
            functions.push(symbol);
        }
        functions.sort_by_key(|s| s.address);

        Self {
            symbols_by_name,
            functions,
            is_pie,
        }
    }

    /// PIE（Position Independent Executable）かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name.get(symbol).map(|s| s.address)
    }

    /// アドレスを含む関数シンボルを返す
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let idx = self.functions.partition_point(|s| s.address <= addr);
        let candidate = self.functions.get(idx.checked_sub(1)?)?;
        // サイズ0のシンボルは次のシンボルの手前までを範囲とみなす
        if candidate.size > 0 {
            candidate.contains(addr).then_some(candidate)
        } else {
            Some(candidate)
        }
    }

    /// すべての関数シンボル（アドレス順）
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.functions.iter()
    }

    /// デマングル名が正規表現にマッチする関数を探す
    ///
    /// 同じアドレスの別名は1つにまとめ、サイズ0のシンボルは除外する。
    pub fn find_functions(&self, pattern: &Regex) -> Vec<&Symbol> {
        let mut seen = BTreeSet::new();
        self.functions
            .iter()
            .filter(|s| s.size > 0 && pattern.is_match(&s.demangled_name))
            .filter(|s| seen.insert(s.address))
            .collect()
    }

    /// 部分一致で検索する（マングル名とデマングル名の両方）
    pub fn find_symbols(&self, pattern: &str) -> Vec<&Symbol> {
        self.functions
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .collect()
    }
}
