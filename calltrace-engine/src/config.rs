//! トレース設定

use std::path::PathBuf;

/// トレース文書の既定の出力先
pub const DEFAULT_TRACE_PATH: &str = "/tmp/function_trace.json";

/// すべての関数にマッチする既定パターン
pub const DEFAULT_PATTERN: &str = ".*";

/// 値デコード設定
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// 構造体の再帰展開の最大深さ
    pub max_depth: usize,
    /// バイト列として読み取る最大要素数
    pub max_buffer_len: usize,
    /// デコード結果の "0" を `<unavailable>` として扱う（旧来の挙動）
    pub zero_as_unavailable: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_buffer_len: 4096,
            zero_as_unavailable: false,
        }
    }
}

/// トレースセッション設定
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// `start` でパターンが省略された場合の既定パターン
    pub default_pattern: String,
    /// 呼び出し元探索でたどるスタックフレームの最大数
    pub max_stack_depth: usize,
    /// 既定に追加するランタイム名前空間
    pub extra_runtime_namespaces: Vec<String>,
    /// 既定に追加するルーター（ディスパッチ）関数パターン
    pub extra_router_patterns: Vec<String>,
    /// スタックから消えたアクティベーションを閉じる
    ///
    /// `false` の場合、アクティベーションは一度開いたら閉じない。
    pub retire_returned: bool,
    /// パニック入口とみなす関数名の正規表現
    pub panic_symbols: Vec<String>,
    /// ランタイム名前空間の関数にはエントリブレークポイントを置かない
    pub skip_runtime_symbols: bool,
    /// トレース文書の出力先
    pub output_path: PathBuf,
    /// 値デコード設定
    pub decode: DecodeConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            default_pattern: DEFAULT_PATTERN.to_string(),
            max_stack_depth: 64,
            extra_runtime_namespaces: Vec::new(),
            extra_router_patterns: Vec::new(),
            retire_returned: true,
            panic_symbols: vec![
                r"^core::panicking::panic(_fmt|_explicit|_display|_str|_nounwind)?$".to_string(),
                r"^core::panicking::assert_failed".to_string(),
                r"^std::panicking::begin_panic".to_string(),
            ],
            skip_runtime_symbols: true,
            output_path: PathBuf::from(DEFAULT_TRACE_PATH),
            decode: DecodeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TraceConfig::default();
        assert_eq!(config.default_pattern, ".*");
        assert!(config.retire_returned);
        assert!(!config.decode.zero_as_unavailable);
        assert_eq!(config.output_path, PathBuf::from(DEFAULT_TRACE_PATH));
    }

    #[test]
    fn test_panic_symbols_compile() {
        for pattern in TraceConfig::default().panic_symbols {
            let re = regex::Regex::new(&pattern).expect("pattern should compile");
            assert!(!re.is_match("mycrate::panic_handler"));
        }
    }
}
