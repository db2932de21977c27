//! 呼び出し元候補のフレームフィルタ
//!
//! スタックを外側へたどるときに、ユーザーコードの呼び出し元になり得ない
//! フレーム（ランタイム内部、区切りのない名前、ルーター）を除外します。

use crate::config::TraceConfig;
use crate::naming::{base_name, has_separator, namespace_prefix};

/// ユーザーコードではないランタイム名前空間
const RUNTIME_NAMESPACES: &[&str] = &[
    // 標準ライブラリ
    "std",
    "core",
    "alloc",
    "panic_unwind",
    "panic_abort",
    // 非同期ランタイム
    "tokio",
    "async_std",
    "futures",
    "futures_util",
    "futures_core",
    "mio",
    // よく使われる依存ライブラリ
    "parking_lot",
    "parking_lot_core",
    "hashbrown",
    "tracing",
    "tracing_core",
    "serde",
    "serde_json",
    "log",
    "bytes",
    "hyper",
    "h2",
    "rayon",
    "rayon_core",
    "crossbeam",
    "crossbeam_channel",
    "crossbeam_utils",
    "gimli",
    "addr2line",
    "object",
    "miniz_oxide",
    "adler",
    "rustc_demangle",
    "std_detect",
    "compiler_builtins",
];

/// 名前に含まれていればルーターとみなすパターン
const ROUTER_PATTERNS: &[&str] = &["::router::", "Router::", "::dispatch::", "::__dispatch"];

/// ルーターとみなすベース名
const ROUTER_BASE_NAME: &str = "route";

/// フレームフィルタ
#[derive(Debug, Clone)]
pub struct FrameFilter {
    runtime_namespaces: Vec<String>,
    router_patterns: Vec<String>,
}

impl FrameFilter {
    /// 既定のフィルタを作成する
    pub fn new() -> Self {
        Self {
            runtime_namespaces: RUNTIME_NAMESPACES.iter().map(|s| s.to_string()).collect(),
            router_patterns: ROUTER_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// 設定の追加分を反映したフィルタを作成する
    pub fn from_config(config: &TraceConfig) -> Self {
        let mut filter = Self::new();
        for ns in &config.extra_runtime_namespaces {
            filter.add_runtime_namespace(ns);
        }
        for pattern in &config.extra_router_patterns {
            filter.add_router_pattern(pattern);
        }
        filter
    }

    /// ランタイム名前空間を追加する
    pub fn add_runtime_namespace(&mut self, namespace: &str) {
        let namespace = namespace.trim_end_matches("::");
        if !self.runtime_namespaces.iter().any(|ns| ns == namespace) {
            self.runtime_namespaces.push(namespace.to_string());
        }
    }

    /// ルーターパターンを追加する
    pub fn add_router_pattern(&mut self, pattern: &str) {
        self.router_patterns.push(pattern.to_string());
    }

    /// ランタイム名前空間に属する名前か
    pub fn is_runtime(&self, function: &str) -> bool {
        let prefix = namespace_prefix(function);
        self.runtime_namespaces.iter().any(|ns| ns == prefix)
            || function.starts_with("__rust")
            || function.starts_with("_start")
            || function.starts_with("__libc")
    }

    /// ルーター（汎用ディスパッチ）関数か
    pub fn is_router(&self, function: &str) -> bool {
        self.router_patterns.iter().any(|p| function.contains(p.as_str()))
            || base_name(function) == ROUTER_BASE_NAME
    }

    /// 呼び出し元の候補になり得るフレームか
    ///
    /// `current` は現在の関数の完全修飾名。同名のフレーム（自己再帰）は除外する。
    pub fn is_candidate_caller(&self, frame_function: &str, current: &str) -> bool {
        frame_function != current
            && has_separator(frame_function)
            && !self.is_runtime(frame_function)
            && !self.is_router(frame_function)
    }
}

impl Default for FrameFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_namespaces() {
        let filter = FrameFilter::new();
        assert!(filter.is_runtime("std::rt::lang_start"));
        assert!(filter.is_runtime("core::ops::function::FnOnce::call_once"));
        assert!(filter.is_runtime("<alloc::vec::Vec<T> as core::ops::drop::Drop>::drop"));
        assert!(filter.is_runtime("tokio::runtime::park::wake"));
        assert!(filter.is_runtime("<u32 as core::iter::traits::accum::Sum>::sum"));
        assert!(!filter.is_runtime("<app::Point as core::fmt::Debug>::fmt"));
        assert!(!filter.is_runtime("my_app::compute"));
        assert!(!filter.is_runtime("stdlib_wrapper::run"));
    }

    #[test]
    fn test_router_detection() {
        let filter = FrameFilter::new();
        assert!(filter.is_router("app::router::handle"));
        assert!(filter.is_router("my_contract::route"));
        assert!(filter.is_router("app::MainRouter::dispatch"));
        assert!(!filter.is_router("app::Contract::route"));
        assert!(filter.is_router("app::route::h1234abcd"));
        assert!(!filter.is_router("app::router_config"));
    }

    #[test]
    fn test_candidate_caller() {
        let filter = FrameFilter::new();
        assert!(filter.is_candidate_caller("app::a", "app::b"));
        // 自己再帰
        assert!(!filter.is_candidate_caller("app::b", "app::b"));
        // 区切りなし
        assert!(!filter.is_candidate_caller("main", "app::b"));
        // ランタイム
        assert!(!filter.is_candidate_caller("std::rt::lang_start", "app::b"));
        // ルーター
        assert!(!filter.is_candidate_caller("app::route", "app::b"));
    }

    #[test]
    fn test_extra_namespaces_from_config() {
        let config = TraceConfig {
            extra_runtime_namespaces: vec!["stylus_sdk::".to_string()],
            extra_router_patterns: vec!["::entrypoint".to_string()],
            ..TraceConfig::default()
        };
        let filter = FrameFilter::from_config(&config);
        assert!(filter.is_runtime("stylus_sdk::abi::router"));
        assert!(filter.is_router("app::entrypoint"));
    }
}
