//! calltrace デバッガのコア機能
//!
//! このクレートは、ptrace によるプロセス制御と DWARF 情報を組み合わせて
//! 呼び出し階層エンジンのホストを実装します。トレース用ブレークポイントの
//! 管理、イベントループ、REPLコマンドの解釈を行います。

pub mod breakpoint;
pub mod command;
pub mod debugger;
pub mod errors;
pub mod frames;
pub mod image;
pub mod memory;
pub mod value;

pub use breakpoint::{Breakpoint, BreakpointKind, BreakpointManager};
pub use command::{Command, HELP};
pub use debugger::{Debugger, DebuggerStatus};
pub use frames::HostStack;
pub use image::{AddressSpace, Image};
pub use memory::HostMemory;
pub use value::DwarfValue;

// 他のクレートから使用するために再エクスポート
pub use calltrace_dwarf::Symbol;
pub use calltrace_engine::{
    render_tree, FrameInfo, StopReason, TraceConfig, TraceDocument, DEFAULT_TRACE_PATH,
};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
