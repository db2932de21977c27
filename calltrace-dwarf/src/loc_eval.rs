//! DWARF ロケーション式評価
//!
//! 引数のロケーション式を評価して、値の置き場所（レジスタ・メモリ・即値）を求めます。

use crate::Result;
use gimli::{Evaluation, EvaluationResult, Location, Piece, Reader, Value};

/// ロケーション評価の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loc {
    /// レジスタに格納されている
    Reg { reg: u16 },
    /// メモリアドレス
    Addr { addr: u64 },
    /// 値そのもの（`DW_OP_stack_value` など）
    Value(Vec<u8>),
    /// 複数のピースから構成される
    Pieces(Vec<LocPiece>),
    /// 最適化により削除された
    Empty,
}

/// ロケーションのピース
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocPiece {
    /// サイズ（ビット）
    pub size_in_bits: u64,
    /// ビットオフセット
    pub bit_offset: Option<u64>,
    /// 実際のロケーション
    pub location: LocPieceLocation,
}

/// ピースのロケーション
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocPieceLocation {
    /// レジスタ
    Reg(u16),
    /// メモリアドレス
    Addr(u64),
    /// 値そのもの
    Value(Vec<u8>),
    /// 最適化により削除された
    Empty,
}

/// ロケーション評価器
pub struct LocationEvaluator<R: Reader> {
    eval: Option<Evaluation<R>>,
    /// 式が空（値は最適化で消えている）
    empty: bool,
    frame_base: Option<u64>,
    cfa: Option<u64>,
}

impl<R: Reader<Offset = usize>> LocationEvaluator<R> {
    /// 新しいロケーション評価器を作成する
    ///
    /// # Arguments
    /// * `expr` - DWARF ロケーション式
    /// * `encoding` - DWARF エンコーディング情報
    pub fn new(expr: gimli::Expression<R>, encoding: gimli::Encoding) -> Self {
        Self {
            empty: expr.0.is_empty(),
            eval: Some(expr.evaluation(encoding)),
            frame_base: None,
            cfa: None,
        }
    }

    /// フレームベースを与える（`DW_OP_fbreg` 用）
    pub fn with_frame_base(mut self, frame_base: Option<u64>) -> Self {
        self.frame_base = frame_base;
        self
    }

    /// CFAを与える（`DW_OP_call_frame_cfa` 用）
    pub fn with_cfa(mut self, cfa: Option<u64>) -> Self {
        self.cfa = cfa;
        self
    }

    /// ロケーション式を評価する
    ///
    /// # Arguments
    /// * `get_reg` - レジスタ値を取得するコールバック
    /// * `read_mem` - メモリを読み取るコールバック
    pub fn evaluate<F, G>(&mut self, mut get_reg: F, mut read_mem: G) -> Result<Loc>
    where
        F: FnMut(u16) -> Result<u64>,
        G: FnMut(u64, usize) -> Result<Vec<u8>>,
    {
        let mut eval = self
            .eval
            .take()
            .ok_or_else(|| anyhow::anyhow!("Evaluation already consumed"))?;
        if self.empty {
            return Ok(Loc::Empty);
        }

        let mut state = eval.evaluate()?;
        loop {
            state = match state {
                EvaluationResult::Complete => break,
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = get_reg(register.0)?;
                    eval.resume_with_register(Value::Generic(value))?
                }
                EvaluationResult::RequiresFrameBase => {
                    let fb = self
                        .frame_base
                        .ok_or_else(|| anyhow::anyhow!("Frame base required but not provided"))?;
                    eval.resume_with_frame_base(fb)?
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    let cfa = self
                        .cfa
                        .ok_or_else(|| anyhow::anyhow!("CFA required but not provided"))?;
                    eval.resume_with_call_frame_cfa(cfa)?
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let bytes = read_mem(address, size as usize)?;
                    let mut value_bytes = [0u8; 8];
                    let copy_size = bytes.len().min(8);
                    value_bytes[..copy_size].copy_from_slice(&bytes[..copy_size]);
                    eval.resume_with_memory(Value::Generic(u64::from_le_bytes(value_bytes)))?
                }
                EvaluationResult::RequiresRelocatedAddress(address) => {
                    eval.resume_with_relocated_address(address)?
                }
                other => {
                    return Err(anyhow::anyhow!("Unsupported evaluation result: {:?}", other));
                }
            };
        }

        let result = eval.result();
        match result.as_slice() {
            [] => Ok(Loc::Empty),
            [piece] if piece.bit_offset.is_none() => Ok(Self::convert_piece(piece)),
            pieces => Ok(Loc::Pieces(
                pieces.iter().map(Self::convert_piece_to_loc_piece).collect(),
            )),
        }
    }

    /// 単一ピースを Loc に変換する
    fn convert_piece(piece: &Piece<R>) -> Loc {
        match &piece.location {
            Location::Register { register } => Loc::Reg { reg: register.0 },
            Location::Address { address } => Loc::Addr { addr: *address },
            Location::Value { value } => Loc::Value(value_bytes(*value)),
            _ => Loc::Empty,
        }
    }

    /// 複数ピース用
    fn convert_piece_to_loc_piece(piece: &Piece<R>) -> LocPiece {
        let location = match &piece.location {
            Location::Register { register } => LocPieceLocation::Reg(register.0),
            Location::Address { address } => LocPieceLocation::Addr(*address),
            Location::Value { value } => LocPieceLocation::Value(value_bytes(*value)),
            _ => LocPieceLocation::Empty,
        };
        LocPiece {
            size_in_bits: piece.size_in_bits.unwrap_or(0),
            bit_offset: piece.bit_offset,
            location,
        }
    }
}

/// 評価スタックの値をリトルエンディアンのバイト列にする
fn value_bytes(value: Value) -> Vec<u8> {
    match value {
        Value::Generic(v) => v.to_le_bytes().to_vec(),
        Value::I8(v) => vec![v as u8],
        Value::U8(v) => vec![v],
        Value::I16(v) => v.to_le_bytes().to_vec(),
        Value::U16(v) => v.to_le_bytes().to_vec(),
        Value::I32(v) => v.to_le_bytes().to_vec(),
        Value::U32(v) => v.to_le_bytes().to_vec(),
        Value::I64(v) => v.to_le_bytes().to_vec(),
        Value::U64(v) => v.to_le_bytes().to_vec(),
        Value::F32(v) => v.to_le_bytes().to_vec(),
        Value::F64(v) => v.to_le_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::{EndianSlice, LittleEndian};

    fn encoding() -> gimli::Encoding {
        gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 8,
        }
    }

    fn evaluate(bytes: &'static [u8], frame_base: Option<u64>, cfa: Option<u64>) -> Result<Loc> {
        let expr = gimli::Expression(EndianSlice::new(bytes, LittleEndian));
        LocationEvaluator::new(expr, encoding())
            .with_frame_base(frame_base)
            .with_cfa(cfa)
            .evaluate(
                |reg| match reg {
                    7 => Ok(0x7fff_0000),
                    _ => Err(anyhow::anyhow!("no register {}", reg)),
                },
                |_, _| Err(anyhow::anyhow!("no memory")),
            )
    }

    #[test]
    fn test_register_location() {
        // DW_OP_reg5 (rdi)
        assert_eq!(evaluate(&[0x55], None, None).unwrap(), Loc::Reg { reg: 5 });
    }

    #[test]
    fn test_frame_base_offset() {
        // DW_OP_fbreg -8
        let loc = evaluate(&[0x91, 0x78], Some(0x1000), None).unwrap();
        assert_eq!(loc, Loc::Addr { addr: 0xff8 });
        assert!(evaluate(&[0x91, 0x78], None, None).is_err());
    }

    #[test]
    fn test_call_frame_cfa() {
        // DW_OP_call_frame_cfa
        let loc = evaluate(&[0x9c], None, Some(0x2000)).unwrap();
        assert_eq!(loc, Loc::Addr { addr: 0x2000 });
    }

    #[test]
    fn test_breg_uses_register() {
        // DW_OP_breg7 +16
        let loc = evaluate(&[0x77, 0x10], None, None).unwrap();
        assert_eq!(loc, Loc::Addr { addr: 0x7fff_0010 });
    }

    #[test]
    fn test_stack_value() {
        // DW_OP_lit3 DW_OP_stack_value
        let loc = evaluate(&[0x33, 0x9f], None, None).unwrap();
        assert_eq!(loc, Loc::Value(3u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_empty_expression() {
        assert_eq!(evaluate(&[], None, None).unwrap(), Loc::Empty);
        // レジスタもメモリも要求しない
        let expr = gimli::Expression(EndianSlice::new(&[][..], LittleEndian));
        let loc = LocationEvaluator::new(expr, encoding())
            .evaluate(
                |reg| Err(anyhow::anyhow!("unexpected register {}", reg)),
                |addr, _| Err(anyhow::anyhow!("unexpected read 0x{:x}", addr)),
            )
            .unwrap();
        assert_eq!(loc, Loc::Empty);
    }

    #[test]
    fn test_pieces() {
        // DW_OP_reg5 DW_OP_piece 8 DW_OP_reg4 DW_OP_piece 8
        let loc = evaluate(&[0x55, 0x93, 0x08, 0x54, 0x93, 0x08], None, None).unwrap();
        match loc {
            Loc::Pieces(pieces) => {
                assert_eq!(pieces.len(), 2);
                assert_eq!(pieces[0].location, LocPieceLocation::Reg(5));
                assert_eq!(pieces[1].size_in_bits, 64);
            }
            other => panic!("Expected pieces, got {:?}", other),
        }
    }
}
