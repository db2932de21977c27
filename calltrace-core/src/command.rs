//! デバッガコマンド

/// コマンド一覧（`help` で表示する）
pub const HELP: &str = "\
Trace commands:
  calltrace start [pattern]  - Start tracing functions matching the regex (default: all)
  calltrace stop             - Stop tracing, write the trace document and print the call tree
  (ct is accepted as an alias of calltrace)

Debug commands:
  continue (c)               - Continue until exit or a fatal signal
  backtrace (bt)             - Show the stack of the last stopped thread
  find <pattern>             - Find function symbols matching the regex
  status                     - Show process and trace status

  help                       - Show this help message
  quit/exit/q                - Exit the debugger";

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// トレース開始（パターン省略時は既定パターン）
    TraceStart(Option<String>),
    /// トレース停止
    TraceStop,
    /// 実行継続
    Continue,
    /// バックトレース表示
    Backtrace,
    /// 関数シンボル検索
    Find(String),
    /// 状態表示
    Status,
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(input: &str) -> Option<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (&head, rest) = parts.split_first()?;

        match head {
            "calltrace" | "ct" => match rest {
                ["start"] => Some(Command::TraceStart(None)),
                ["start", pattern @ ..] => Some(Command::TraceStart(Some(pattern.join(" ")))),
                ["stop"] => Some(Command::TraceStop),
                _ => None,
            },
            "continue" | "c" => Some(Command::Continue),
            "backtrace" | "bt" => Some(Command::Backtrace),
            "find" if !rest.is_empty() => Some(Command::Find(rest.join(" "))),
            "status" => Some(Command::Status),
            "help" | "h" | "?" => Some(Command::Help),
            "quit" | "q" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("continue"), Some(Command::Continue));
        assert_eq!(Command::parse("c"), Some(Command::Continue));
        assert_eq!(Command::parse("bt"), Some(Command::Backtrace));
        assert_eq!(Command::parse("  status  "), Some(Command::Status));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("step"), None);
    }

    #[test]
    fn test_parse_trace_commands() {
        assert_eq!(
            Command::parse("calltrace start"),
            Some(Command::TraceStart(None))
        );
        assert_eq!(
            Command::parse("ct start ^app::"),
            Some(Command::TraceStart(Some("^app::".to_string())))
        );
        assert_eq!(Command::parse("calltrace stop"), Some(Command::TraceStop));
        assert_eq!(Command::parse("calltrace"), None);
        assert_eq!(Command::parse("calltrace stop now"), None);
    }

    #[test]
    fn test_parse_find() {
        assert_eq!(
            Command::parse("find compute"),
            Some(Command::Find("compute".to_string()))
        );
        assert_eq!(Command::parse("find"), None);
    }
}
