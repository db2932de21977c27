//! メモリ内のホスト実装
//!
//! 実際のデバッグ対象なしでイベント列を再生するための `ValueView`、
//! `ThreadStack`、`MemoryAccess` の実装です。

use crate::host::{FrameInfo, MemoryAccess, SourceLocation, ThreadStack, ValueView};
use crate::{Result, TraceError};
use std::collections::BTreeMap;

/// メモリ内の値
#[derive(Debug, Clone, Default)]
pub struct SyntheticValue {
    name: Option<String>,
    type_name: Option<String>,
    scalar: Option<String>,
    summary: Option<String>,
    unavailable: bool,
    children: Vec<SyntheticValue>,
    bytes: Option<Vec<u8>>,
}

impl SyntheticValue {
    /// 情報を持たない値を作成する
    pub fn leaf(name: &str, type_name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            type_name: Some(type_name.to_string()),
            ..Self::default()
        }
    }

    /// スカラー値を作成する
    pub fn scalar(name: &str, type_name: &str, text: &str) -> Self {
        Self {
            scalar: Some(text.to_string()),
            ..Self::leaf(name, type_name)
        }
    }

    /// バイト列を背後に持つ値を作成する
    pub fn bytes(name: &str, type_name: &str, bytes: Vec<u8>) -> Self {
        Self {
            bytes: Some(bytes),
            ..Self::leaf(name, type_name)
        }
    }

    /// 64ビット符号なし整数を作成する
    pub fn u64_value(name: &str, value: u64) -> Self {
        Self {
            scalar: Some(value.to_string()),
            bytes: Some(value.to_le_bytes().to_vec()),
            ..Self::leaf(name, "u64")
        }
    }

    /// 子フィールドを持つ構造体を作成する
    ///
    /// すべての子がバイト列を持つ場合、それらを連結したものを背後のバイト列とする。
    pub fn structure(name: &str, type_name: &str, children: Vec<SyntheticValue>) -> Self {
        let bytes = children
            .iter()
            .map(|c| c.bytes.clone())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat());
        Self {
            children,
            bytes,
            ..Self::leaf(name, type_name)
        }
    }

    /// 配列を作成する
    pub fn array(name: &str, type_name: &str, elements: Vec<SyntheticValue>) -> Self {
        Self::structure(name, type_name, elements)
    }

    /// 1バイトずつの子要素を持つバイト列（`Vec<u8>` 等）を作成する
    pub fn byte_children(name: &str, type_name: &str, bytes: &[u8]) -> Self {
        let elements = bytes
            .iter()
            .enumerate()
            .map(|(i, b)| Self {
                scalar: Some(b.to_string()),
                bytes: Some(vec![*b]),
                ..Self::leaf(&format!("[{}]", i), "u8")
            })
            .collect();
        Self::structure(name, type_name, elements)
    }

    /// 要約文字列を設定する
    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    /// 読み取り不能な値にする
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }
}

impl ValueView for SyntheticValue {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn type_name(&self) -> Option<String> {
        self.type_name.clone()
    }

    fn scalar(&self) -> Option<String> {
        self.scalar.clone()
    }

    fn summary(&self) -> Option<String> {
        self.summary.clone()
    }

    fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn child_count(&self) -> usize {
        self.children.len()
    }

    fn child_at(&self, index: usize) -> Option<Box<dyn ValueView + '_>> {
        self.children
            .get(index)
            .map(|c| Box::new(c.clone()) as Box<dyn ValueView>)
    }

    fn read_bytes(&self, len: usize) -> Option<Vec<u8>> {
        self.bytes.as_ref()?.get(..len).map(|b| b.to_vec())
    }
}

/// メモリ内のスタックフレーム
#[derive(Debug, Clone)]
struct SyntheticFrame {
    info: FrameInfo,
    arguments: Vec<SyntheticValue>,
}

/// メモリ内のコールスタック（フレーム0が最も内側）
#[derive(Debug, Clone, Default)]
pub struct SyntheticStack {
    frames: Vec<SyntheticFrame>,
    registers: Vec<u64>,
}

impl SyntheticStack {
    /// 空のスタックを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 外側にフレームを追加する
    pub fn with_frame(mut self, function: &str, location: Option<(&str, u32)>) -> Self {
        self.push_frame(Some(function), location, Vec::new());
        self
    }

    /// 引数付きのフレームを追加する
    pub fn frame_with_args(
        mut self,
        function: &str,
        location: Option<(&str, u32)>,
        arguments: Vec<SyntheticValue>,
    ) -> Self {
        self.push_frame(Some(function), location, arguments);
        self
    }

    /// 名前を解決できないフレームを追加する
    pub fn unnamed_frame(mut self) -> Self {
        self.push_frame(None, None, Vec::new());
        self
    }

    /// 入口レジスタの値を設定する
    pub fn with_registers(mut self, registers: Vec<u64>) -> Self {
        self.registers = registers;
        self
    }

    fn push_frame(
        &mut self,
        function: Option<&str>,
        location: Option<(&str, u32)>,
        arguments: Vec<SyntheticValue>,
    ) {
        let index = self.frames.len();
        self.frames.push(SyntheticFrame {
            info: FrameInfo {
                index,
                function: function.map(str::to_string),
                location: location.map(|(file, line)| SourceLocation::new(file, line)),
                pc: 0x1000 + (index as u64) * 0x10,
            },
            arguments,
        });
    }
}

impl ThreadStack for SyntheticStack {
    fn frame(&self, index: usize) -> Option<FrameInfo> {
        self.frames.get(index).map(|f| f.info.clone())
    }

    fn arguments(&self, index: usize) -> Vec<Box<dyn ValueView + '_>> {
        self.frames
            .get(index)
            .map(|f| {
                f.arguments
                    .iter()
                    .map(|a| Box::new(a.clone()) as Box<dyn ValueView>)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn entry_registers(&self) -> Vec<u64> {
        self.registers.clone()
    }
}

/// メモリ内のアドレス空間
#[derive(Debug, Clone, Default)]
pub struct SyntheticMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SyntheticMemory {
    /// 空のアドレス空間を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 領域を配置する
    pub fn with_region(mut self, addr: u64, bytes: Vec<u8>) -> Self {
        self.regions.insert(addr, bytes);
        self
    }
}

impl MemoryAccess for SyntheticMemory {
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let (start, bytes) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(TraceError::MemoryRead { addr, len })?;
        let offset = (addr - start) as usize;
        let end = offset
            .checked_add(len)
            .ok_or(TraceError::MemoryRead { addr, len })?;
        bytes
            .get(offset..end)
            .map(|b| b.to_vec())
            .ok_or(TraceError::MemoryRead { addr, len })
    }
}
