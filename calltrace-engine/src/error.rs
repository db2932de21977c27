//! エンジンのエラー型
//!
//! ホスト能力の失敗（プロセス未接続、ブレークポイント作成失敗など）だけが
//! エラーとして呼び出し元に返ります。デコードの不確かさや構造上の異常は
//! エラーにならず、データとして吸収されます。

use thiserror::Error;

/// トレース操作のエラー
#[derive(Debug, Error)]
pub enum TraceError {
    /// デバッグ対象プロセスが存在しない
    #[error("No valid target: {0}")]
    NoTarget(String),

    /// パターンが正規表現として不正
    #[error("Invalid trace pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// ブレークポイントを作成できなかった
    #[error("Failed to create breakpoint for '{0}'")]
    BreakpointFailed(String),

    /// トレースセッションが開始されていない
    #[error("No trace session is active")]
    NotActive,

    /// デバッグ対象メモリの読み取りに失敗した
    #[error("Failed to read {len} bytes at 0x{addr:x}")]
    MemoryRead { addr: u64, len: usize },

    /// トレース文書の読み書きに失敗した
    #[error("Trace file I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// シリアライズに失敗した
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// エンジンの結果型
pub type Result<T> = std::result::Result<T, TraceError>;
