//! パニック・エラーの検出と呼び出しへの対応付け
//!
//! セッションごとに一度だけ発火するラッチを持ちます。パニック入口の
//! ブレークポイント、またはトレース停止時の停止理由から `ExecutionStatus`
//! を決定し、どの呼び出し記録がエラーを起こしたかを判定します。

use crate::config::TraceConfig;
use crate::filter::FrameFilter;
use crate::host::{FrameInfo, MemoryAccess, SourceLocation, StopEvent, StopReason, ThreadStack, Tid};
use crate::naming::{has_separator, names_overlap};
use crate::record::{CallRecord, ExecutionStatus, RecordStore};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};

/// メッセージを取り出せなかったときのメッセージ
pub const DEFAULT_PANIC_MESSAGE: &str = "panic/assert detected";

/// メモリから読み取るメッセージの最大長
const MAX_MESSAGE_LEN: u64 = 4096;

/// フォーマット引数構造体のリテラル片の最大数
const MAX_PIECES: u64 = 16;

/// パニック機構とみなす名前の断片（ランタイム・Cライブラリのフレームのみ）
const MACHINERY_KEYWORDS: &[&str] = &["panic", "abort", "assert_failed", "raise", "pthread_kill"];

/// パニック入口のブレークポイントで停止したイベント
pub struct PanicEvent<'a> {
    pub tid: Tid,
    /// 停止したスレッドのスタック（フレーム0がパニック入口）
    pub stack: &'a dyn ThreadStack,
    /// デバッグ対象のメモリ
    pub memory: &'a dyn MemoryAccess,
}

/// エラー相関器
#[derive(Debug)]
pub struct ErrorCorrelator {
    latched: AtomicBool,
    filter: FrameFilter,
    panic_symbols: Vec<Regex>,
    max_stack_depth: usize,
    macro_line: Option<Regex>,
    quoted: Option<Regex>,
}

impl ErrorCorrelator {
    /// 設定から相関器を作成する
    ///
    /// コンパイルできないパニック入口パターンは警告して無視する。
    pub fn new(config: &TraceConfig) -> Self {
        let panic_symbols = config
            .panic_symbols
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "ignoring invalid panic symbol pattern");
                    None
                }
            })
            .collect();

        Self {
            latched: AtomicBool::new(false),
            filter: FrameFilter::from_config(config),
            panic_symbols,
            max_stack_depth: config.max_stack_depth,
            macro_line: Regex::new(
                r"\b(assert(_eq|_ne)?|debug_assert(_eq|_ne)?|panic|unreachable|todo|unimplemented)!",
            )
            .ok(),
            quoted: Regex::new(r#""((?:[^"\\]|\\.)*)""#).ok(),
        }
    }

    /// パニック入口の関数名か
    pub fn is_panic_entry(&self, function: &str) -> bool {
        self.panic_symbols.iter().any(|re| re.is_match(function))
    }

    /// パニック機構（入口、ランタイム内部、Cライブラリのabort）のフレームか
    pub fn is_panic_machinery(&self, function: &str) -> bool {
        if self.is_panic_entry(function) {
            return true;
        }
        if has_separator(function) && !self.filter.is_runtime(function) {
            return false;
        }
        MACHINERY_KEYWORDS.iter().any(|k| function.contains(k))
    }

    /// ラッチが発火済みか
    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    /// ラッチを戻す（新しいセッションの開始時）
    pub fn reset(&self) {
        self.latched.store(false, Ordering::SeqCst);
    }

    fn try_latch(&self) -> bool {
        self.latched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// パニック入口のブレークポイントを処理する
    ///
    /// 最初の1回だけ実行状態をエラーにし、`true` を返す。
    pub fn on_panic(&self, event: &PanicEvent<'_>, store: &RecordStore) -> bool {
        if !self.try_latch() {
            tracing::trace!(tid = event.tid.0, "panic latch already fired");
            return false;
        }

        let culprit = self.first_user_frame(event.stack, 0);
        let location = culprit.as_ref().and_then(|f| f.location.clone());
        let message = self.extract_message(
            &event.stack.entry_registers(),
            event.memory,
            location.as_ref(),
        );

        tracing::info!(
            tid = event.tid.0,
            function = ?culprit.as_ref().and_then(|f| f.function.as_deref()),
            message = %message,
            "panic detected"
        );

        let status = ExecutionStatus::error(message)
            .with_function(culprit.and_then(|f| f.function))
            .with_location(location.as_ref());
        store.latch_error(status)
    }

    /// トレース停止時の停止理由を分類する
    ///
    /// ラッチが未発火でエラーと判定した場合、実行状態をエラーにする。
    pub fn on_stop(&self, event: &StopEvent<'_>, store: &RecordStore) -> bool {
        if self.is_latched() {
            return false;
        }

        let status = match &event.reason {
            StopReason::Running | StopReason::Exited(0) => None,
            StopReason::Exited(code) => Some(ExecutionStatus::error(format!(
                "process exited with status {}",
                code
            ))),
            StopReason::Signal(signal) if event.reason.is_abort() => Some(
                self.scan_stack(event.stack).unwrap_or_else(|| {
                    ExecutionStatus::error(format!("stopped by signal {}", signal))
                }),
            ),
            StopReason::Signal(signal) => {
                Some(ExecutionStatus::error(format!("stopped by signal {}", signal)))
            }
            StopReason::Exception(description) => Some(ExecutionStatus::error(format!(
                "stopped by unhandled exception: {}",
                description
            ))),
            StopReason::Breakpoint => self.scan_stack(event.stack),
        };

        tracing::debug!(reason = ?event.reason, error = status.is_some(), "classified stop");

        match status {
            Some(status) if self.try_latch() => store.latch_error(status),
            _ => false,
        }
    }

    /// スタック上のパニック機構を探し、その呼び出し元をエラー位置とする
    fn scan_stack(&self, stack: Option<&dyn ThreadStack>) -> Option<ExecutionStatus> {
        let stack = stack?;
        let frames: Vec<FrameInfo> = (0..self.max_stack_depth)
            .map_while(|index| stack.frame(index))
            .collect();

        let outermost = frames.iter().rposition(|f| {
            f.function
                .as_deref()
                .is_some_and(|name| self.is_panic_machinery(name))
        })?;

        let culprit = frames[outermost + 1..]
            .iter()
            .find(|f| f.location.is_some() && self.is_user_frame(f))
            .unwrap_or(&frames[outermost]);

        let message = culprit
            .location
            .as_ref()
            .and_then(|loc| self.source_message(loc))
            .unwrap_or_else(|| DEFAULT_PANIC_MESSAGE.to_string());

        Some(
            ExecutionStatus::error(message)
                .with_function(culprit.function.clone())
                .with_location(culprit.location.as_ref()),
        )
    }

    fn is_user_frame(&self, frame: &FrameInfo) -> bool {
        frame.function.as_deref().is_some_and(|name| {
            has_separator(name) && !self.filter.is_runtime(name) && !self.is_panic_machinery(name)
        })
    }

    /// `start` 以降で最初のユーザーコードのフレーム
    fn first_user_frame(&self, stack: &dyn ThreadStack, start: usize) -> Option<FrameInfo> {
        (start..self.max_stack_depth)
            .map_while(|index| stack.frame(index))
            .find(|f| self.is_user_frame(f))
    }

    /// パニックメッセージを取り出す
    ///
    /// `registers` はパニック入口での整数引数レジスタ。
    pub fn extract_message(
        &self,
        registers: &[u64],
        memory: &dyn MemoryAccess,
        location: Option<&SourceLocation>,
    ) -> String {
        let first = registers.first().copied();
        let second = registers.get(1).copied();

        if let (Some(ptr), Some(len)) = (first, second) {
            if let Some(text) = read_text(memory, ptr, len) {
                return text;
            }
        }
        if let Some(ptr) = first {
            if let Some(text) = read_first_piece(memory, ptr) {
                return text;
            }
            if let Some(text) = read_packed_str(memory, ptr) {
                return text;
            }
        }

        location
            .and_then(|loc| self.source_message(loc))
            .unwrap_or_else(|| DEFAULT_PANIC_MESSAGE.to_string())
    }

    /// ソースファイルの該当行からメッセージを作る
    fn source_message(&self, location: &SourceLocation) -> Option<String> {
        let index = usize::try_from(location.line).ok()?.checked_sub(1)?;
        let source = std::fs::read_to_string(location.path()).ok()?;
        let line = source.lines().nth(index)?.trim();
        if line.is_empty() {
            return None;
        }
        Some(self.message_from_line(line))
    }

    /// アサーション・パニックマクロの行なら引用文字列を、そうでなければ行全体を返す
    pub fn message_from_line(&self, line: &str) -> String {
        let line = line.trim();
        if self.macro_line.as_ref().is_some_and(|re| re.is_match(line)) {
            if let Some(captures) = self.quoted.as_ref().and_then(|re| re.captures(line)) {
                return captures[1].to_string();
            }
        }
        line.to_string()
    }
}

impl Default for ErrorCorrelator {
    fn default() -> Self {
        Self::new(&TraceConfig::default())
    }
}

/// (ptr, len) の組を印字可能なUTF-8文字列として読む
fn read_text(memory: &dyn MemoryAccess, ptr: u64, len: u64) -> Option<String> {
    if ptr == 0 || len == 0 || len > MAX_MESSAGE_LEN {
        return None;
    }
    let bytes = memory.read_memory(ptr, len as usize).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let printable = text
        .chars()
        .all(|c| !c.is_control() || c == '\n' || c == '\t');
    printable.then_some(text)
}

/// フォーマット引数構造体の最初のリテラル片を読む
fn read_first_piece(memory: &dyn MemoryAccess, args: u64) -> Option<String> {
    let pieces = memory.read_u64(args).ok()?;
    let count = memory.read_u64(args.checked_add(8)?).ok()?;
    if !(1..=MAX_PIECES).contains(&count) {
        return None;
    }
    read_packed_str(memory, pieces)
}

/// アドレスが指す (ptr, len) の組を読む
fn read_packed_str(memory: &dyn MemoryAccess, addr: u64) -> Option<String> {
    let ptr = memory.read_u64(addr).ok()?;
    let len = memory.read_u64(addr.checked_add(8)?).ok()?;
    read_text(memory, ptr, len)
}

/// エラーを起こした呼び出し記録のインデックス
///
/// 位置の完全一致（新しい順）、関数名の部分一致、最後の記録の順に探す。
pub fn blamed_index(records: &[CallRecord], status: &ExecutionStatus) -> Option<usize> {
    if !status.is_error || records.is_empty() {
        return None;
    }

    if let (Some(file), Some(line)) = (status.error_file.as_deref(), status.error_line) {
        if let Some(index) = records
            .iter()
            .rposition(|r| r.location.is_some() && r.file() == file && r.line() == line)
        {
            return Some(index);
        }
    }

    if let Some(function) = status.error_function.as_deref() {
        if let Some(index) = records
            .iter()
            .rposition(|r| names_overlap(&r.function, function))
        {
            return Some(index);
        }
    }

    Some(records.len() - 1)
}
