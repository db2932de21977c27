//! calltrace ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace によるスレッドの停止と再開、レジスタアクセス、メモリアクセス、
//! ソフトウェアブレークポイントの設定などを行います。x86_64 Linux 専用です。

pub mod breakpoint;
pub mod memory;
pub mod process;
pub mod registers;
pub mod thread;

pub use breakpoint::{CodePatch, SoftwareBreakpoint};
pub use memory::{Memory, MemoryMapping};
pub use process::{Process, StopKind, ThreadStop};
pub use registers::Registers;
pub use thread::{ThreadId, ThreadSet};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
