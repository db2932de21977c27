//! 呼び出し階層の構築
//!
//! 戻りイベントを使わず、エントリイベントごとの生きたスタックの走査から
//! 呼び出し元（親）を推定します。

use crate::config::TraceConfig;
use crate::context::ThreadCallContext;
use crate::decoder::ValueDecoder;
use crate::filter::FrameFilter;
use crate::host::{FrameInfo, ThreadStack, Tid};
use crate::naming::{base_name, namespace_prefix};
use crate::record::{ArgValue, CallId, NewRecord, RecordStore, NO_PARENT};
use std::collections::HashSet;

/// 関数名を解決できなかったときの名前
pub const UNKNOWN_FUNCTION: &str = "<unknown>";

/// 関数エントリイベント
pub struct EntryEvent<'a> {
    /// イベントを発生させたスレッド
    pub tid: Tid,
    /// そのスレッドのスタック（フレーム0がエントリした関数）
    pub stack: &'a dyn ThreadStack,
}

/// 呼び出し階層ビルダー
#[derive(Debug, Clone)]
pub struct CallHierarchyBuilder {
    filter: FrameFilter,
    decoder: ValueDecoder,
    max_stack_depth: usize,
    retire_returned: bool,
}

impl CallHierarchyBuilder {
    /// 設定からビルダーを作成する
    pub fn new(config: &TraceConfig) -> Self {
        Self {
            filter: FrameFilter::from_config(config),
            decoder: ValueDecoder::new(config.decode.clone()),
            max_stack_depth: config.max_stack_depth,
            retire_returned: config.retire_returned,
        }
    }

    /// フレームフィルタを取得する
    pub fn filter(&self) -> &FrameFilter {
        &self.filter
    }

    /// フレームの引数をデコードする
    pub fn decode_arguments(&self, stack: &dyn ThreadStack, index: usize) -> Vec<ArgValue> {
        stack
            .arguments(index)
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let name = value.name().unwrap_or_else(|| format!("arg{}", i));
                ArgValue::new(name, self.decoder.decode(value.as_ref()))
            })
            .collect()
    }

    /// フレーム1から外側へスタックをたどる
    ///
    /// 2番目の値は、最大深さに達する前にスタックの終端まで到達したかどうか。
    fn walk(&self, stack: &dyn ThreadStack) -> (Vec<FrameInfo>, bool) {
        let mut frames = Vec::new();
        for index in 1..self.max_stack_depth {
            match stack.frame(index) {
                Some(frame) => frames.push(frame),
                None => return (frames, true),
            }
        }
        (frames, false)
    }

    /// `start` 以降で最初に呼び出し元候補となるフレームを探す
    fn find_caller<'f>(
        &self,
        frames: &'f [FrameInfo],
        start: usize,
        current: &str,
    ) -> Option<(usize, &'f FrameInfo)> {
        frames.iter().enumerate().skip(start).find(|(_, frame)| {
            frame
                .function
                .as_deref()
                .is_some_and(|name| self.filter.is_candidate_caller(name, current))
        })
    }

    /// エントリイベントを処理する
    ///
    /// 現在の関数の呼び出しID（既存の記録に統合した場合はそのID）を返す。
    pub fn on_entry(
        &self,
        ctx: &mut ThreadCallContext,
        event: &EntryEvent<'_>,
        store: &RecordStore,
    ) -> Option<CallId> {
        let current = event.stack.frame(0)?;
        let function = current
            .function
            .clone()
            .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
        let base = base_name(&function);
        let args = self.decode_arguments(event.stack, 0);
        let (outer, complete) = self.walk(event.stack);

        if self.retire_returned && complete {
            let live: HashSet<String> = outer
                .iter()
                .filter_map(|f| f.function.as_deref())
                .map(base_name)
                .collect();
            let retired = ctx.retire_absent(&live);
            if retired > 0 {
                tracing::trace!(tid = event.tid.0, retired, "retired returned activations");
            }
        }

        if let Some(existing) = ctx.active(&base) {
            if store.backfill(existing, current.location.clone(), args) {
                tracing::trace!(call_id = existing, function = %function, "back-filled record");
            }
            return Some(existing);
        }

        let parent = self.resolve_parent(ctx, event, &outer, &function, store);
        let call_id = store.append(NewRecord {
            tid: event.tid,
            parent_call_id: parent,
            function: function.clone(),
            location: current.location,
            args,
        });
        ctx.activate(base, call_id);

        tracing::debug!(
            tid = event.tid.0,
            call_id,
            parent,
            function = %function,
            "recorded call"
        );
        Some(call_id)
    }

    /// 親の呼び出しIDを決める
    ///
    /// 呼び出し元が未記録でも同じ名前空間に属するなら、その記録を合成する。
    fn resolve_parent(
        &self,
        ctx: &mut ThreadCallContext,
        event: &EntryEvent<'_>,
        outer: &[FrameInfo],
        function: &str,
        store: &RecordStore,
    ) -> CallId {
        let Some((position, caller)) = self.find_caller(outer, 0, function) else {
            return NO_PARENT;
        };
        let caller_name = caller.function.as_deref().unwrap_or(UNKNOWN_FUNCTION);
        let caller_base = base_name(caller_name);

        if let Some(id) = ctx.active(&caller_base) {
            return id;
        }
        if namespace_prefix(caller_name) != namespace_prefix(function) {
            return NO_PARENT;
        }

        let grand_parent = self
            .find_caller(outer, position + 1, caller_name)
            .and_then(|(_, frame)| frame.function.as_deref())
            .and_then(|name| ctx.active(&base_name(name)))
            .unwrap_or(NO_PARENT);

        let args = self.decode_arguments(event.stack, caller.index);
        let call_id = store.append(NewRecord {
            tid: event.tid,
            parent_call_id: grand_parent,
            function: caller_name.to_string(),
            location: caller.location.clone(),
            args,
        });
        ctx.activate(caller_base, call_id);

        tracing::debug!(call_id, function = %caller_name, "synthesized caller record");
        call_id
    }
}

impl Default for CallHierarchyBuilder {
    fn default() -> Self {
        Self::new(&TraceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticStack, SyntheticValue};

    fn enter(
        builder: &CallHierarchyBuilder,
        ctx: &mut ThreadCallContext,
        store: &RecordStore,
        stack: &SyntheticStack,
    ) -> Option<CallId> {
        let event = EntryEvent {
            tid: ctx.tid(),
            stack,
        };
        builder.on_entry(ctx, &event, store)
    }

    fn runtime_tail(stack: SyntheticStack) -> SyntheticStack {
        stack
            .with_frame("std::rt::lang_start_internal", None)
            .with_frame("main", None)
    }

    #[test]
    fn test_parent_from_active_caller() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let a = runtime_tail(SyntheticStack::new().with_frame("app::a", Some(("f.rs", 3))));
        let b = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::b", Some(("f.rs", 9)))
                .with_frame("app::a", Some(("f.rs", 4))),
        );

        let a_id = enter(&builder, &mut ctx, &store, &a).unwrap();
        let b_id = enter(&builder, &mut ctx, &store, &b).unwrap();

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].parent_call_id, NO_PARENT);
        assert_eq!(records[1].call_id, b_id);
        assert_eq!(records[1].parent_call_id, a_id);
    }

    #[test]
    fn test_synthesizes_caller_in_same_namespace() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        // app::helper は未トレースだが app 名前空間に属する
        let stack = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::leaf", Some(("f.rs", 20)))
                .frame_with_args(
                    "app::helper",
                    Some(("f.rs", 15)),
                    vec![SyntheticValue::scalar("n", "u32", "4")],
                ),
        );
        let leaf = enter(&builder, &mut ctx, &store, &stack).unwrap();

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].function, "app::helper");
        assert_eq!(records[0].parent_call_id, NO_PARENT);
        assert_eq!(records[0].args, vec![ArgValue::new("n", "4")]);
        assert_eq!(records[1].call_id, leaf);
        assert_eq!(records[1].parent_call_id, records[0].call_id);
        assert_eq!(ctx.active("helper"), Some(records[0].call_id));
    }

    #[test]
    fn test_synthesized_caller_finds_grandparent() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let root = runtime_tail(SyntheticStack::new().with_frame("app::root", None));
        let root_id = enter(&builder, &mut ctx, &store, &root).unwrap();

        let leaf = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::leaf", None)
                .with_frame("app::middle", None)
                .with_frame("app::root", None),
        );
        enter(&builder, &mut ctx, &store, &leaf).unwrap();

        let records = store.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].function, "app::middle");
        assert_eq!(records[1].parent_call_id, root_id);
        assert_eq!(records[2].parent_call_id, records[1].call_id);
    }

    #[test]
    fn test_foreign_caller_is_not_recorded() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let stack = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::callback", None)
                .with_frame("other_lib::drive", None),
        );
        enter(&builder, &mut ctx, &store, &stack).unwrap();

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].parent_call_id, NO_PARENT);
    }

    #[test]
    fn test_closure_called_through_std_iterator_has_parent() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let outer = runtime_tail(SyntheticStack::new().with_frame("app::checksum", None));
        let checksum = enter(&builder, &mut ctx, &store, &outer).unwrap();

        let closure = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::checksum::{{closure}}", None)
                .with_frame("core::iter::adapters::map::map_fold::{{closure}}", None)
                .with_frame("<u32 as core::iter::traits::accum::Sum>::sum", None)
                .with_frame("app::checksum", None),
        );
        let id = enter(&builder, &mut ctx, &store, &closure).unwrap();

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].call_id, id);
        assert_eq!(records[1].parent_call_id, checksum);
    }

    #[test]
    fn test_recursion_is_deduplicated() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let first = runtime_tail(SyntheticStack::new().with_frame("app::fact", None));
        let nested = runtime_tail(
            SyntheticStack::new()
                .frame_with_args(
                    "app::fact",
                    Some(("f.rs", 2)),
                    vec![SyntheticValue::scalar("n", "u64", "2")],
                )
                .with_frame("app::fact", Some(("f.rs", 4))),
        );

        let id = enter(&builder, &mut ctx, &store, &first).unwrap();
        assert_eq!(enter(&builder, &mut ctx, &store, &nested), Some(id));

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line(), 2);
        assert_eq!(records[0].args, vec![ArgValue::new("n", "2")]);
    }

    #[test]
    fn test_sequential_calls_are_separate_after_return() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let main = runtime_tail(SyntheticStack::new().with_frame("app::run", None));
        let step = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::step", None)
                .with_frame("app::run", None),
        );

        let run = enter(&builder, &mut ctx, &store, &main).unwrap();
        let first = enter(&builder, &mut ctx, &store, &step).unwrap();
        let second = enter(&builder, &mut ctx, &store, &step).unwrap();

        assert_ne!(first, second);
        let records = store.records();
        assert_eq!(records.len(), 3);
        assert!(records[1..].iter().all(|r| r.parent_call_id == run));
    }

    #[test]
    fn test_forward_only_mode_merges_repeated_calls() {
        let config = TraceConfig {
            retire_returned: false,
            ..TraceConfig::default()
        };
        let builder = CallHierarchyBuilder::new(&config);
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let step = runtime_tail(SyntheticStack::new().with_frame("app::step", None));
        let first = enter(&builder, &mut ctx, &store, &step).unwrap();
        let second = enter(&builder, &mut ctx, &store, &step).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_router_frames_are_skipped() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));

        let entry = runtime_tail(SyntheticStack::new().with_frame("app::entry", None));
        let entry_id = enter(&builder, &mut ctx, &store, &entry).unwrap();

        let handler = runtime_tail(
            SyntheticStack::new()
                .with_frame("app::handler", None)
                .with_frame("app::route", None)
                .with_frame("app::entry", None),
        );
        enter(&builder, &mut ctx, &store, &handler).unwrap();

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].parent_call_id, entry_id);
    }

    #[test]
    fn test_empty_stack_is_ignored() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));
        assert_eq!(enter(&builder, &mut ctx, &store, &SyntheticStack::new()), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unnamed_frame_is_unknown() {
        let builder = CallHierarchyBuilder::default();
        let store = RecordStore::new();
        let mut ctx = ThreadCallContext::new(Tid(1));
        let stack = SyntheticStack::new().unnamed_frame();
        enter(&builder, &mut ctx, &store, &stack).unwrap();
        assert_eq!(store.records()[0].function, UNKNOWN_FUNCTION);
    }
}
