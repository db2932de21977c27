//! DWARFローダーとシンボル解決のテスト
//!
//! テストバイナリ自身のデバッグ情報を読む。

use calltrace_dwarf::{
    DebugInfo, DwarfLoader, LineInfoProvider, ParameterLocator, PrimitiveEncoding,
    SymbolResolver, TypeKind,
};
use regex::Regex;

#[inline(never)]
fn sample_target(count: u64, label: &str) -> u64 {
    count + label.len() as u64
}

fn load_self() -> DwarfLoader {
    let exe = std::env::current_exe().expect("current_exe");
    DwarfLoader::load(&exe).expect("Failed to load DWARF from test binary")
}

#[test]
fn test_find_functions_by_pattern() {
    assert_eq!(sample_target(std::hint::black_box(2), "abc"), 5);

    let loader = load_self();
    let resolver = SymbolResolver::new(&loader).expect("Failed to create symbol resolver");

    let found = resolver.find_functions(&Regex::new("sample_target$").unwrap());
    println!("Found {} symbols matching sample_target", found.len());
    assert_eq!(found.len(), 1);
    let symbol = found[0];
    assert!(symbol.demangled_name.ends_with("::sample_target"));
    assert!(symbol.size > 0);

    let back = resolver
        .reverse_resolve(symbol.address + 1)
        .expect("reverse resolve");
    assert_eq!(back.address, symbol.address);
    println!("✓ {} @ 0x{:x}", symbol.demangled_name, symbol.address);
}

#[test]
fn test_function_index_and_parameters() {
    assert_eq!(sample_target(std::hint::black_box(1), ""), 1);

    let loader = load_self();
    let info = DebugInfo::new(&loader).expect("Failed to index debug info");
    let function = info
        .functions()
        .iter()
        .find(|f| f.name.ends_with("::sample_target"))
        .expect("sample_target in debug info");
    assert!(info.function_at(function.low_pc).is_some());

    let params = ParameterLocator::new(&info)
        .parameters(function)
        .expect("parameters");
    let names: Vec<_> = params.iter().map(|p| p.name.clone()).collect();
    assert_eq!(
        names,
        vec![Some("count".to_string()), Some("label".to_string())]
    );

    assert_eq!(params[0].type_info.name, "u64");
    assert_eq!(
        params[0].type_info.kind,
        TypeKind::Primitive(PrimitiveEncoding::Unsigned)
    );
    assert_eq!(params[1].type_info.name, "&str");
    assert_eq!(params[1].type_info.size, 16);
    println!("✓ parameters: {:?}", names);
}

#[test]
fn test_line_lookup() {
    assert_eq!(sample_target(std::hint::black_box(3), "x"), 4);

    let loader = load_self();
    let info = DebugInfo::new(&loader).expect("Failed to index debug info");
    let lines = LineInfoProvider::new(&loader).expect("line provider");
    let function = info
        .functions()
        .iter()
        .find(|f| f.name.ends_with("::sample_target"))
        .expect("sample_target in debug info");

    let entry = lines.prologue_end(function.low_pc, function.high_pc);
    assert!(entry >= function.low_pc && entry < function.high_pc);

    let line = lines
        .lookup(entry)
        .expect("lookup")
        .expect("line info for sample_target");
    assert_eq!(line.file, "test_loader.rs");
    println!("✓ sample_target at {}:{}", line.file, line.line);
}
