//! calltrace DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報の解析機能を提供します。
//! シンボルの検索、アドレスからソース行への変換、関数引数のロケーション評価、
//! 型情報の抽出、CFIによるスタックの巻き戻しを行います。

pub mod decode;
pub mod functions;
pub mod lines;
pub mod loader;
pub mod loc_eval;
pub mod memory;
pub mod params;
pub mod registers;
pub mod symbols;
pub mod type_info;
pub mod unwind;

pub use decode::{format_primitive, read_signed, read_unsigned};
pub use functions::{DebugInfo, FunctionEntry};
pub use lines::{LineInfo, LineInfoProvider};
pub use loader::{DwarfLoader, DwarfReader};
pub use loc_eval::{Loc, LocPiece, LocPieceLocation, LocationEvaluator};
pub use memory::MemoryReader;
pub use params::{FrameState, ParamLocation, Parameter, ParameterLocator};
pub use registers::DwarfRegisters;
pub use symbols::{Symbol, SymbolResolver};
pub use type_info::{
    EnumVariant, FieldInfo, PrimitiveEncoding, TypeInfo, TypeInfoExtractor, TypeKind,
};
pub use unwind::{UnwindFrame, Unwinder};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
