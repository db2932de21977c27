//! 関数引数のロケーション評価
//!
//! `DW_TAG_formal_parameter` を宣言順に集め、停止中のフレームで値のバイト列を読みます。

use crate::functions::entry_name;
use crate::loc_eval::{Loc, LocPieceLocation, LocationEvaluator};
use crate::type_info::{TypeInfo, TypeInfoExtractor};
use crate::{DebugInfo, DwarfReader, DwarfRegisters, FunctionEntry, MemoryReader, Result};

/// 引数のロケーション記述
#[derive(Debug, Clone)]
pub enum ParamLocation {
    /// 単一のロケーション式
    Expr(gimli::Expression<DwarfReader>),
    /// ロケーションリスト（範囲はファイル上のアドレス）
    List(Vec<(gimli::Range, gimli::Expression<DwarfReader>)>),
    /// ロケーションなし（最適化で消えた）
    None,
}

/// 関数引数
#[derive(Debug, Clone)]
pub struct Parameter {
    /// 引数名（無名の引数は `None`）
    pub name: Option<String>,
    /// 型情報
    pub type_info: TypeInfo,
    pub location: ParamLocation,
}

/// 停止中のフレームの状態
pub struct FrameState<'m> {
    /// ファイル上のPC
    pub pc: u64,
    /// 復元できたレジスタ
    pub registers: DwarfRegisters,
    /// このフレームのCFA
    pub cfa: Option<u64>,
    /// デバッグ対象のメモリ
    pub memory: &'m dyn MemoryReader,
}

/// 引数ロケーター
pub struct ParameterLocator<'a> {
    info: &'a DebugInfo,
}

impl<'a> ParameterLocator<'a> {
    /// 引数ロケーターを作成する
    pub fn new(info: &'a DebugInfo) -> Self {
        Self { info }
    }

    /// 関数の引数を宣言順に取得する
    pub fn parameters(&self, function: &FunctionEntry) -> Result<Vec<Parameter>> {
        let dwarf = self.info.dwarf();
        let unit = self
            .info
            .unit(function)
            .ok_or_else(|| anyhow::anyhow!("No unit for function {}", function.name))?;
        let types = TypeInfoExtractor::new(dwarf, unit);

        let mut parameters = Vec::new();
        let mut tree = unit.entries_tree(Some(function.offset))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_formal_parameter {
                continue;
            }

            // 抽象インスタンスへの参照は名前と型だけを補う
            let origin = match entry.attr_value(gimli::DW_AT_abstract_origin)? {
                Some(gimli::AttributeValue::UnitRef(offset)) => Some(unit.entry(offset)?),
                _ => None,
            };
            let described = origin.as_ref().unwrap_or(entry);

            let name = entry_name(dwarf, unit, entry, gimli::DW_AT_name)
                .or_else(|| entry_name(dwarf, unit, described, gimli::DW_AT_name));
            let type_info = if entry.attr_value(gimli::DW_AT_type)?.is_some() {
                types.type_of(entry)?
            } else {
                types.type_of(described)?
            };
            let location = self.location_of(unit, entry)?;

            parameters.push(Parameter {
                name,
                type_info,
                location,
            });
        }

        tracing::trace!(
            function = %function.name,
            count = parameters.len(),
            "collected parameters"
        );
        Ok(parameters)
    }

    /// `DW_AT_location` を読む
    fn location_of(
        &self,
        unit: &gimli::Unit<DwarfReader>,
        entry: &gimli::DebuggingInformationEntry<DwarfReader>,
    ) -> Result<ParamLocation> {
        let Some(value) = entry.attr_value(gimli::DW_AT_location)? else {
            return Ok(ParamLocation::None);
        };
        if let gimli::AttributeValue::Exprloc(expr) = value {
            return Ok(ParamLocation::Expr(expr));
        }

        let Some(mut locations) = self.info.dwarf().attr_locations(unit, value)? else {
            return Ok(ParamLocation::None);
        };
        let mut list = Vec::new();
        while let Some(entry) = locations.next()? {
            list.push((entry.range, entry.data));
        }
        Ok(ParamLocation::List(list))
    }

    /// 関数のフレームベース（`DW_AT_frame_base`）を評価する
    pub fn frame_base(&self, function: &FunctionEntry, frame: &FrameState<'_>) -> Option<u64> {
        let unit = self.info.unit(function)?;
        let entry = unit.entry(function.offset).ok()?;
        let gimli::AttributeValue::Exprloc(expr) = entry.attr_value(gimli::DW_AT_frame_base).ok()??
        else {
            return None;
        };
        match evaluate(expr, unit.encoding(), None, frame).ok()? {
            Loc::Reg { reg } => frame.registers.get(reg),
            Loc::Addr { addr } => Some(addr),
            _ => None,
        }
    }

    /// 引数の値のバイト列を読む
    ///
    /// 読めない場合（最適化で消えた、呼び出し側保存レジスタが失われた等）は `None`。
    pub fn read_value(
        &self,
        function: &FunctionEntry,
        parameter: &Parameter,
        frame: &FrameState<'_>,
    ) -> Option<(Vec<u8>, Option<u64>)> {
        let unit = self.info.unit(function)?;
        let expr = match &parameter.location {
            ParamLocation::Expr(expr) => expr.clone(),
            ParamLocation::List(list) => list
                .iter()
                .find(|(range, _)| frame.pc >= range.begin && frame.pc < range.end)
                .map(|(_, expr)| expr.clone())?,
            ParamLocation::None => return None,
        };

        let frame_base = self.frame_base(function, frame);
        let loc = match evaluate(expr, unit.encoding(), frame_base, frame) {
            Ok(loc) => loc,
            Err(e) => {
                tracing::trace!(error = %e, "parameter location unavailable");
                return None;
            }
        };
        read_location(&loc, parameter.type_info.size as usize, frame)
    }
}

/// ロケーション式を評価する
fn evaluate(
    expr: gimli::Expression<DwarfReader>,
    encoding: gimli::Encoding,
    frame_base: Option<u64>,
    frame: &FrameState<'_>,
) -> Result<Loc> {
    LocationEvaluator::new(expr, encoding)
        .with_frame_base(frame_base)
        .with_cfa(frame.cfa)
        .evaluate(
            |reg| {
                frame
                    .registers
                    .get(reg)
                    .ok_or_else(|| anyhow::anyhow!("Register {} not recovered", reg))
            },
            |addr, size| frame.memory.read(addr, size),
        )
}

/// ロケーションから `size` バイト読む。メモリ上の値ならそのアドレスも返す。
pub fn read_location(loc: &Loc, size: usize, frame: &FrameState<'_>) -> Option<(Vec<u8>, Option<u64>)> {
    match loc {
        Loc::Reg { reg } => {
            let mut bytes = frame.registers.get(*reg)?.to_le_bytes().to_vec();
            bytes.resize(size, 0);
            Some((bytes, None))
        }
        Loc::Addr { addr } => frame.memory.read(*addr, size).ok().map(|b| (b, Some(*addr))),
        Loc::Value(bytes) => {
            let mut bytes = bytes.clone();
            bytes.resize(size, 0);
            Some((bytes, None))
        }
        Loc::Pieces(pieces) => {
            let mut out = Vec::with_capacity(size);
            for piece in pieces {
                let len = (piece.size_in_bits / 8) as usize;
                let mut chunk = match &piece.location {
                    LocPieceLocation::Reg(reg) => frame.registers.get(*reg)?.to_le_bytes().to_vec(),
                    LocPieceLocation::Addr(addr) => frame.memory.read(*addr, len).ok()?,
                    LocPieceLocation::Value(bytes) => bytes.clone(),
                    LocPieceLocation::Empty => return None,
                };
                chunk.resize(len, 0);
                out.extend_from_slice(&chunk);
            }
            out.resize(size, 0);
            Some((out, None))
        }
        Loc::Empty => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loc_eval::LocPiece;
    use crate::memory::testing::FakeMemory;
    use crate::registers::{RDI, RSI};

    fn frame(memory: &FakeMemory) -> FrameState<'_> {
        let mut registers = DwarfRegisters::new();
        registers.set(RDI, 0x1122_3344_5566_7788);
        registers.set(RSI, 3);
        FrameState {
            pc: 0x1000,
            registers,
            cfa: Some(0x7fff_0000),
            memory,
        }
    }

    #[test]
    fn test_read_register_location() {
        let memory = FakeMemory::default();
        let frame = frame(&memory);
        let (bytes, addr) = read_location(&Loc::Reg { reg: RDI }, 4, &frame).unwrap();
        assert_eq!(bytes, vec![0x88, 0x77, 0x66, 0x55]);
        assert_eq!(addr, None);
        assert!(read_location(&Loc::Reg { reg: 3 }, 8, &frame).is_none());
    }

    #[test]
    fn test_read_memory_location() {
        let memory = FakeMemory::default().with(0x5000, vec![1, 2, 3, 4]);
        let frame = frame(&memory);
        let (bytes, addr) = read_location(&Loc::Addr { addr: 0x5001 }, 2, &frame).unwrap();
        assert_eq!(bytes, vec![2, 3]);
        assert_eq!(addr, Some(0x5001));
        assert!(read_location(&Loc::Addr { addr: 0x9000 }, 2, &frame).is_none());
    }

    #[test]
    fn test_read_pieces() {
        let memory = FakeMemory::default();
        let frame = frame(&memory);
        let loc = Loc::Pieces(vec![
            LocPiece {
                size_in_bits: 64,
                bit_offset: None,
                location: LocPieceLocation::Reg(RSI),
            },
            LocPiece {
                size_in_bits: 32,
                bit_offset: None,
                location: LocPieceLocation::Value(vec![9, 0, 0, 0, 0, 0, 0, 0]),
            },
        ]);
        let (bytes, _) = read_location(&loc, 12, &frame).unwrap();
        assert_eq!(bytes, vec![3, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0]);
    }

    #[test]
    fn test_empty_location_is_unavailable() {
        let memory = FakeMemory::default();
        assert!(read_location(&Loc::Empty, 8, &frame(&memory)).is_none());
    }
}
