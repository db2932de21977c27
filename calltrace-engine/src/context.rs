//! スレッドごとの呼び出しコンテキスト

use crate::host::Tid;
use crate::record::CallId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// スレッドごとの呼び出しコンテキスト
///
/// ベース名から、そのスレッドで開いているアクティベーションの呼び出しIDへの対応を持つ。
#[derive(Debug, Clone)]
pub struct ThreadCallContext {
    tid: Tid,
    active_functions: HashMap<String, CallId>,
}

impl ThreadCallContext {
    /// 新しいコンテキストを作成する
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            active_functions: HashMap::new(),
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// ベース名に対応する開いたアクティベーションを取得する
    pub fn active(&self, base_name: &str) -> Option<CallId> {
        self.active_functions.get(base_name).copied()
    }

    /// アクティベーションを開く
    pub fn activate(&mut self, base_name: impl Into<String>, call_id: CallId) {
        self.active_functions.insert(base_name.into(), call_id);
    }

    /// 開いているアクティベーションの数
    pub fn len(&self) -> usize {
        self.active_functions.len()
    }

    /// 開いているアクティベーションがないか
    pub fn is_empty(&self) -> bool {
        self.active_functions.is_empty()
    }

    /// 実際のスタックに存在しないアクティベーションを閉じる
    ///
    /// `live` は現在のスタック上の全フレームのベース名。閉じた数を返す。
    pub fn retire_absent(&mut self, live: &HashSet<String>) -> usize {
        let before = self.active_functions.len();
        self.active_functions.retain(|base, _| live.contains(base));
        before - self.active_functions.len()
    }

    /// すべてのアクティベーションを閉じる
    pub fn clear(&mut self) {
        self.active_functions.clear();
    }
}

/// スレッドIDからコンテキストへの対応
///
/// イベント処理中はコンテキストを取り出して占有し、終わったら戻す。
#[derive(Debug, Default)]
pub struct ThreadContexts {
    contexts: Mutex<HashMap<Tid, ThreadCallContext>>,
}

impl ThreadContexts {
    /// 空の対応を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// コンテキストを取り出す（なければ作成する）
    pub fn checkout(&self, tid: Tid) -> ThreadCallContext {
        self.contexts
            .lock()
            .remove(&tid)
            .unwrap_or_else(|| ThreadCallContext::new(tid))
    }

    /// コンテキストを戻す
    pub fn checkin(&self, context: ThreadCallContext) {
        self.contexts.lock().insert(context.tid(), context);
    }

    /// 登録されているスレッド数
    pub fn thread_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// すべてのコンテキストを破棄する
    pub fn clear(&self) {
        self.contexts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_and_lookup() {
        let mut ctx = ThreadCallContext::new(Tid(7));
        ctx.activate("foo", 3);
        assert_eq!(ctx.active("foo"), Some(3));
        assert_eq!(ctx.active("bar"), None);
        ctx.activate("foo", 5);
        assert_eq!(ctx.active("foo"), Some(5));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_retire_absent() {
        let mut ctx = ThreadCallContext::new(Tid(1));
        ctx.activate("a", 1);
        ctx.activate("b", 2);
        ctx.activate("c", 3);

        let live: HashSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(ctx.retire_absent(&live), 1);
        assert_eq!(ctx.active("b"), None);
        assert_eq!(ctx.active("a"), Some(1));
    }

    #[test]
    fn test_checkout_checkin() {
        let contexts = ThreadContexts::new();
        let mut ctx = contexts.checkout(Tid(1));
        ctx.activate("a", 1);
        contexts.checkin(ctx);

        let other = contexts.checkout(Tid(2));
        assert!(other.is_empty());
        contexts.checkin(other);

        assert_eq!(contexts.checkout(Tid(1)).active("a"), Some(1));
        assert_eq!(contexts.thread_count(), 1);
    }
}
