//! スタックとDWARF値のテスト
//!
//! ptraceは使わず、テストプロセス自身のメモリとデバッグ情報を読む。

use calltrace_core::{AddressSpace, DwarfValue, HostStack, Image};
use calltrace_dwarf::{DwarfRegisters, ParameterLocator, UnwindFrame};
use calltrace_engine::{ThreadStack, ValueDecoder};
use calltrace_target::Memory;

#[inline(never)]
fn sample_target(count: u64, label: &str) -> usize {
    std::hint::black_box(label.len() + count as usize)
}

#[inline(never)]
fn sample_payload(payload: Vec<u8>) -> usize {
    std::hint::black_box(payload.len())
}

fn own_space() -> (AddressSpace, Memory) {
    let exe = std::env::current_exe().expect("current_exe");
    let memory = Memory::new(std::process::id() as i32);
    let mut space = AddressSpace::new(Image::load(&exe).expect("Failed to load test binary"));
    space.refresh(&memory.mappings().expect("mappings"));
    (space, memory)
}

#[test]
fn test_host_stack_symbolizes_own_frames() {
    assert_eq!(sample_target(std::hint::black_box(2), "ab"), 4);

    let (space, memory) = own_space();
    let image = space.main();
    assert!(image.is_mapped());

    let symbol = image
        .symbols()
        .all_symbols()
        .find(|s| s.display_name().ends_with("sample_target"))
        .expect("sample_target symbol")
        .clone();
    let entry = image.runtime_address(image.entry_address(&symbol));
    let start = image.runtime_address(symbol.address);
    assert!(entry >= start);
    assert!(image.contains(entry));

    let frames = vec![
        UnwindFrame {
            pc: entry,
            cfa: None,
            registers: DwarfRegisters::new(),
        },
        UnwindFrame {
            // 外側のフレームは呼び出し直後のPCを持つ
            pc: start + 1,
            cfa: None,
            registers: DwarfRegisters::new(),
        },
    ];
    let stack = HostStack::new(&space, &memory, frames, vec![7, 8]);
    assert_eq!(stack.depth(), 2);

    let top = stack.frame(0).expect("frame 0");
    let name = top.function.clone().expect("function name");
    assert!(name.ends_with("sample_target"), "got {}", name);
    let location = top.location.expect("source location");
    assert_eq!(location.file, "test_stack.rs");

    let outer = stack.frame(1).expect("frame 1");
    assert_eq!(outer.function, top.function);
    assert!(stack.frame(2).is_none());
    assert_eq!(stack.entry_registers(), vec![7, 8]);

    // レジスタが無いので値は読めないが、名前と型は出る
    let args = stack.arguments(0);
    let names: Vec<_> = args.iter().filter_map(|a| a.name()).collect();
    assert_eq!(names, vec!["count".to_string(), "label".to_string()]);
    assert_eq!(args[1].type_name().as_deref(), Some("&str"));
    assert!(!args[0].is_available());
}

#[test]
fn test_str_parameter_decodes_from_live_memory() {
    assert_eq!(sample_target(std::hint::black_box(0), "x"), 1);

    let (space, memory) = own_space();
    let image = space.main();
    let info = image.debug_info().expect("debug info");
    let function = info
        .functions()
        .iter()
        .find(|f| f.name.ends_with("sample_target"))
        .expect("sample_target in debug info");
    let params = ParameterLocator::new(info)
        .parameters(function)
        .expect("parameters");
    let label = params
        .iter()
        .find(|p| p.name.as_deref() == Some("label"))
        .expect("label parameter");

    let text = String::from("hello calltrace");
    let s: &str = &text;
    let mut bytes = (s.as_ptr() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&(s.len() as u64).to_le_bytes());

    let value = DwarfValue::new(
        label.name.clone(),
        label.type_info.clone(),
        Some(bytes),
        None,
        &memory,
    );
    let rendered = ValueDecoder::default().decode(&value);
    assert_eq!(rendered, "\"hello calltrace\"");
}

#[test]
fn test_vec_u8_parameter_decodes_from_live_memory() {
    assert_eq!(sample_payload(std::hint::black_box(vec![1, 2])), 2);

    let (space, memory) = own_space();
    let info = space.main().debug_info().expect("debug info");
    let function = info
        .functions()
        .iter()
        .find(|f| f.name.ends_with("sample_payload"))
        .expect("sample_payload in debug info");
    let params = ParameterLocator::new(info)
        .parameters(function)
        .expect("parameters");
    let payload = params
        .iter()
        .find(|p| p.name.as_deref() == Some("payload"))
        .expect("payload parameter");
    // rustcは外側の型名を修飾せずに出す
    assert!(
        payload.type_info.name.contains("Vec<u8"),
        "got {}",
        payload.type_info.name
    );

    let data = b"hello".to_vec();
    let size = std::mem::size_of::<Vec<u8>>();
    assert_eq!(payload.type_info.size as usize, size);
    let header = memory
        .read(&data as *const Vec<u8> as u64, size)
        .expect("vec header");

    let value = DwarfValue::new(
        payload.name.clone(),
        payload.type_info.clone(),
        Some(header),
        None,
        &memory,
    );
    assert_eq!(ValueDecoder::default().decode(&value), "0x68656c6c6f");
    std::hint::black_box(&data);
}
