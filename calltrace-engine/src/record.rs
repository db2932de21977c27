//! 呼び出し記録と実行状態
//!
//! セッション全体で共有される記録リストと `ExecutionStatus` は
//! 1つのミューテックスで保護します。ロックは追加・読み取りの間だけ保持し、
//! デコードやメモリ読み取りの間は保持しません。

use crate::decoder::UNAVAILABLE;
use crate::host::{SourceLocation, Tid};
use parking_lot::Mutex;

/// 呼び出しID（0は「親なし」）
pub type CallId = u64;

/// 親がないことを表す呼び出しID
pub const NO_PARENT: CallId = 0;

/// 位置が不明なときのファイル名
pub const UNKNOWN_FILE: &str = "<unknown>";

/// デコード済みの引数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValue {
    pub name: String,
    pub value: String,
}

impl ArgValue {
    /// 新しい引数を作成する
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// 関数アクティベーション1回分の記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call_id: CallId,
    pub parent_call_id: CallId,
    /// 完全修飾された関数名
    pub function: String,
    /// 入口のソース位置
    pub location: Option<SourceLocation>,
    /// 宣言順の引数
    pub args: Vec<ArgValue>,
    /// 記録したスレッド
    pub tid: Tid,
}

impl CallRecord {
    /// ファイル名（不明なら `<unknown>`）
    pub fn file(&self) -> &str {
        self.location
            .as_ref()
            .map(|l| l.file.as_str())
            .unwrap_or(UNKNOWN_FILE)
    }

    /// ディレクトリ
    pub fn directory(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.directory.as_deref())
    }

    /// 行番号（不明なら0）
    pub fn line(&self) -> u32 {
        self.location.as_ref().map(|l| l.line).unwrap_or(0)
    }
}

/// まだIDを持たない記録
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub tid: Tid,
    pub parent_call_id: CallId,
    pub function: String,
    pub location: Option<SourceLocation>,
    pub args: Vec<ArgValue>,
}

/// 引数リストが有効な値を含まないか
fn args_unknown(args: &[ArgValue]) -> bool {
    args.iter().all(|a| a.value == UNAVAILABLE)
}

/// セッションの実行状態
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStatus {
    pub is_error: bool,
    pub error_message: Option<String>,
    pub error_function: Option<String>,
    pub error_file: Option<String>,
    pub error_line: Option<u32>,
}

impl ExecutionStatus {
    /// エラー状態を作成する
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// エラー発生位置の関数を設定する
    pub fn with_function(mut self, function: Option<String>) -> Self {
        self.error_function = function;
        self
    }

    /// エラー発生位置を設定する
    pub fn with_location(mut self, location: Option<&SourceLocation>) -> Self {
        if let Some(loc) = location {
            self.error_file = Some(loc.file.clone());
            self.error_line = Some(loc.line);
        }
        self
    }
}

#[derive(Debug)]
struct StoreState {
    records: Vec<CallRecord>,
    status: ExecutionStatus,
    next_call_id: CallId,
}

impl StoreState {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            status: ExecutionStatus::default(),
            next_call_id: 1,
        }
    }
}

/// セッション共有の記録ストア
#[derive(Debug)]
pub struct RecordStore {
    state: Mutex<StoreState>,
}

impl RecordStore {
    /// 空のストアを作成する
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new()),
        }
    }

    /// 記録を追加し、新しい呼び出しIDを返す
    ///
    /// IDはロック内で採番するため、追加順に厳密に増加する。
    pub fn append(&self, record: NewRecord) -> CallId {
        let mut state = self.state.lock();
        let call_id = state.next_call_id;
        state.next_call_id += 1;
        state.records.push(CallRecord {
            call_id,
            parent_call_id: record.parent_call_id,
            function: record.function,
            location: record.location,
            args: record.args,
            tid: record.tid,
        });
        call_id
    }

    /// 既存記録の不明な位置・引数を埋める
    ///
    /// 何か埋めた場合は `true` を返す。
    pub fn backfill(
        &self,
        call_id: CallId,
        location: Option<SourceLocation>,
        args: Vec<ArgValue>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.records.iter_mut().find(|r| r.call_id == call_id) else {
            return false;
        };

        let mut changed = false;
        if record.location.is_none() && location.is_some() {
            record.location = location;
            changed = true;
        }
        if args_unknown(&record.args) && !args_unknown(&args) {
            record.args = args;
            changed = true;
        }
        changed
    }

    /// 記録のスナップショットを追加順で取得する
    pub fn records(&self) -> Vec<CallRecord> {
        self.state.lock().records.clone()
    }

    /// 記録数を取得する
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// 記録が空かどうか
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 実行状態を取得する
    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status.clone()
    }

    /// 記録と実行状態を同時に取得する
    pub fn snapshot(&self) -> (Vec<CallRecord>, ExecutionStatus) {
        let state = self.state.lock();
        (state.records.clone(), state.status.clone())
    }

    /// エラー状態に遷移する（既にエラーなら何もしない）
    pub fn latch_error(&self, status: ExecutionStatus) -> bool {
        let mut state = self.state.lock();
        if state.status.is_error {
            return false;
        }
        state.status = ExecutionStatus {
            is_error: true,
            ..status
        };
        true
    }

    /// すべての記録と状態を破棄する
    pub fn reset(&self) {
        *self.state.lock() = StoreState::new();
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(function: &str, parent: CallId) -> NewRecord {
        NewRecord {
            tid: Tid(1),
            parent_call_id: parent,
            function: function.to_string(),
            location: None,
            args: Vec::new(),
        }
    }

    #[test]
    fn test_append_mints_increasing_ids() {
        let store = RecordStore::new();
        let a = store.append(new_record("app::a", NO_PARENT));
        let b = store.append(new_record("app::b", a));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(store.records()[1].parent_call_id, 1);
    }

    #[test]
    fn test_backfill_only_unknown_fields() {
        let store = RecordStore::new();
        let id = store.append(NewRecord {
            args: vec![ArgValue::new("x", UNAVAILABLE)],
            ..new_record("app::a", NO_PARENT)
        });

        assert!(store.backfill(
            id,
            Some(SourceLocation::new("f.rs", 3)),
            vec![ArgValue::new("x", "5")]
        ));
        // 既に埋まっているので変わらない
        assert!(!store.backfill(
            id,
            Some(SourceLocation::new("g.rs", 9)),
            vec![ArgValue::new("x", "6")]
        ));

        let record = &store.records()[0];
        assert_eq!(record.file(), "f.rs");
        assert_eq!(record.line(), 3);
        assert_eq!(record.args, vec![ArgValue::new("x", "5")]);
    }

    #[test]
    fn test_latch_error_once() {
        let store = RecordStore::new();
        assert!(store.latch_error(ExecutionStatus::error("first")));
        assert!(!store.latch_error(ExecutionStatus::error("second")));
        assert_eq!(store.status().error_message.as_deref(), Some("first"));
    }

    #[test]
    fn test_reset_clears_ids() {
        let store = RecordStore::new();
        store.append(new_record("app::a", NO_PARENT));
        store.latch_error(ExecutionStatus::error("boom"));
        store.reset();
        assert!(store.is_empty());
        assert!(!store.status().is_error);
        assert_eq!(store.append(new_record("app::a", NO_PARENT)), 1);
    }

    #[test]
    fn test_unknown_location_defaults() {
        let store = RecordStore::new();
        store.append(new_record("app::a", NO_PARENT));
        let record = &store.records()[0];
        assert_eq!(record.file(), UNKNOWN_FILE);
        assert_eq!(record.line(), 0);
        assert_eq!(record.directory(), None);
    }
}
