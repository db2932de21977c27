//! トレースセッション
//!
//! ホストのアダプタはエントリ・パニック・停止の各イベントをこのオブジェクトへ
//! 渡します。セッションは記録ストアとスレッドごとのコンテキストを所有し、
//! 停止時にトレース文書を組み立てます。

use crate::config::TraceConfig;
use crate::context::ThreadContexts;
use crate::correlator::{ErrorCorrelator, PanicEvent};
use crate::export::TraceDocument;
use crate::filter::FrameFilter;
use crate::hierarchy::{CallHierarchyBuilder, EntryEvent};
use crate::host::{StopEvent, ThreadStack, Tid};
use crate::record::{CallId, CallRecord, ExecutionStatus, RecordStore};
use crate::{Result, TraceError};
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};

/// トレースセッション
#[derive(Debug)]
pub struct TraceSession {
    config: TraceConfig,
    builder: CallHierarchyBuilder,
    correlator: ErrorCorrelator,
    store: RecordStore,
    contexts: ThreadContexts,
    active: AtomicBool,
    pattern: Mutex<Option<String>>,
}

impl TraceSession {
    /// 新しいセッションを作成する（まだ開始しない）
    pub fn new(config: TraceConfig) -> Self {
        Self {
            builder: CallHierarchyBuilder::new(&config),
            correlator: ErrorCorrelator::new(&config),
            store: RecordStore::new(),
            contexts: ThreadContexts::new(),
            active: AtomicBool::new(false),
            pattern: Mutex::new(None),
            config,
        }
    }

    /// 設定を取得する
    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// フレームフィルタを取得する
    pub fn filter(&self) -> &FrameFilter {
        self.builder.filter()
    }

    /// エラー相関器を取得する
    pub fn correlator(&self) -> &ErrorCorrelator {
        &self.correlator
    }

    /// トレースを開始する
    ///
    /// パターンを省略すると既定パターンを使う。前回の記録はすべて破棄される。
    /// 不正なパターンの場合はセッションを開始しない。
    pub fn start(&self, pattern: Option<&str>) -> Result<Regex> {
        let pattern = pattern.unwrap_or(&self.config.default_pattern);
        let regex = Regex::new(pattern).map_err(|source| TraceError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        self.store.reset();
        self.contexts.clear();
        self.correlator.reset();
        *self.pattern.lock() = Some(pattern.to_string());
        self.active.store(true, Ordering::SeqCst);

        tracing::info!(pattern = %pattern, "trace session started");
        Ok(regex)
    }

    /// セッションが開始されているか
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 開始時のパターン
    pub fn pattern(&self) -> Option<String> {
        self.pattern.lock().clone()
    }

    /// 関数エントリイベントを処理する
    pub fn on_entry(&self, tid: Tid, stack: &dyn ThreadStack) -> Option<CallId> {
        if !self.is_active() {
            return None;
        }
        let mut context = self.contexts.checkout(tid);
        let call_id = self
            .builder
            .on_entry(&mut context, &EntryEvent { tid, stack }, &self.store);
        self.contexts.checkin(context);
        call_id
    }

    /// パニック入口イベントを処理する
    pub fn on_panic(&self, event: &PanicEvent<'_>) -> bool {
        self.is_active() && self.correlator.on_panic(event, &self.store)
    }

    /// 停止イベントを処理する
    pub fn on_stop(&self, event: &StopEvent<'_>) -> bool {
        self.is_active() && self.correlator.on_stop(event, &self.store)
    }

    /// トレースを停止し、文書を返す
    ///
    /// `event` は最後の停止理由。ラッチ未発火ならここでエラー判定する。
    pub fn stop(&self, event: &StopEvent<'_>) -> Result<TraceDocument> {
        if !self.is_active() {
            return Err(TraceError::NotActive);
        }
        self.correlator.on_stop(event, &self.store);
        self.active.store(false, Ordering::SeqCst);

        let (records, status) = self.store.snapshot();
        tracing::info!(
            calls = records.len(),
            error = status.is_error,
            "trace session stopped"
        );
        Ok(TraceDocument::build(&records, &status))
    }

    /// トレースを停止し、文書を設定の出力先にも書き出す
    pub fn stop_and_write(&self, event: &StopEvent<'_>) -> Result<TraceDocument> {
        let document = self.stop(event)?;
        document.write_to(&self.config.output_path)?;
        tracing::info!(path = %self.config.output_path.display(), "trace written");
        Ok(document)
    }

    /// 記録のスナップショット
    pub fn records(&self) -> Vec<CallRecord> {
        self.store.records()
    }

    /// 実行状態
    pub fn status(&self) -> ExecutionStatus {
        self.store.status()
    }

    /// 観測したスレッド数
    pub fn thread_count(&self) -> usize {
        self.contexts.thread_count()
    }
}

impl Default for TraceSession {
    fn default() -> Self {
        Self::new(TraceConfig::default())
    }
}
