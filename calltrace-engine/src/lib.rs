//! calltrace 呼び出し階層再構築エンジン
//!
//! このクレートは、デバッグホストから届く関数エントリイベントを受け取り、
//! 呼び出しツリーを再構築します。引数値のデコード、パニックの検出と
//! 呼び出しへの対応付け、トレース文書の出力も行います。
//! ホスト（ptrace、LLDB等）には依存せず、`host`モジュールのトレイト越しに動作します。

pub mod config;
pub mod context;
pub mod correlator;
pub mod decoder;
pub mod error;
pub mod export;
pub mod filter;
pub mod hierarchy;
pub mod host;
pub mod naming;
pub mod record;
pub mod session;
pub mod synthetic;

pub use config::{DecodeConfig, TraceConfig, DEFAULT_TRACE_PATH};
pub use context::{ThreadCallContext, ThreadContexts};
pub use correlator::{blamed_index, ErrorCorrelator, PanicEvent, DEFAULT_PANIC_MESSAGE};
pub use decoder::{ValueDecoder, UNAVAILABLE};
pub use error::{Result, TraceError};
pub use export::{render_tree, ArgEntry, CallEntry, TraceDocument, TraceStatus};
pub use filter::FrameFilter;
pub use hierarchy::{CallHierarchyBuilder, EntryEvent, UNKNOWN_FUNCTION};
pub use host::{
    FrameInfo, MemoryAccess, SourceLocation, StopEvent, StopReason, ThreadStack, Tid, ValueView,
};
pub use record::{ArgValue, CallId, CallRecord, ExecutionStatus, NewRecord, RecordStore, NO_PARENT};
pub use session::TraceSession;
