//! calltrace CLI - コマンドラインインターフェース
//!
//! 関数呼び出し階層トレーサ calltrace のREPLと非対話モード

mod repl;

use anyhow::{Context, Result};
use calltrace_core::{render_tree, Debugger, TraceConfig, TraceDocument, DEFAULT_TRACE_PATH};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// calltrace - Function call hierarchy tracer
#[derive(Parser)]
#[command(name = "calltrace")]
#[command(version = "0.1.0")]
#[command(about = "Records the call hierarchy and arguments of a Rust program", long_about = None)]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "debug" or "calltrace_core=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(flatten)]
    options: TraceOptions,

    #[command(subcommand)]
    command: DebugCommand,
}

/// トレース設定の上書き
#[derive(Args, Debug, Default)]
struct TraceOptions {
    /// Maximum number of stack frames walked per event
    #[arg(long, global = true)]
    max_stack_depth: Option<usize>,

    /// Maximum nesting depth when rendering struct values
    #[arg(long, global = true)]
    decode_depth: Option<usize>,

    /// Keep activations open after the function returns
    #[arg(long, global = true)]
    no_retire: bool,

    /// Render a decoded zero as <unavailable>
    #[arg(long, global = true)]
    zero_as_unavailable: bool,

    /// Also place entry breakpoints on runtime namespaces (std, core, ...)
    #[arg(long, global = true)]
    include_runtime: bool,

    /// Additional runtime namespace to skip when looking for callers
    #[arg(long = "runtime-namespace", global = true)]
    runtime_namespaces: Vec<String>,

    /// Additional router function pattern (regex)
    #[arg(long = "router", global = true)]
    routers: Vec<String>,
}

impl TraceOptions {
    /// 既定設定にフラグを適用する
    fn to_config(&self) -> TraceConfig {
        let mut config = TraceConfig::default();
        if let Some(depth) = self.max_stack_depth {
            config.max_stack_depth = depth;
        }
        if let Some(depth) = self.decode_depth {
            config.decode.max_depth = depth;
        }
        config.retire_returned = !self.no_retire;
        config.decode.zero_as_unavailable = self.zero_as_unavailable;
        config.skip_runtime_symbols = !self.include_runtime;
        config
            .extra_runtime_namespaces
            .extend(self.runtime_namespaces.iter().cloned());
        config.extra_router_patterns.extend(self.routers.iter().cloned());
        config
    }
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch an executable and debug it interactively
    Run {
        /// Path to the executable binary
        binary: String,

        /// Where `calltrace stop` writes the trace document
        #[arg(short, long, default_value = DEFAULT_TRACE_PATH)]
        output: PathBuf,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: String,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,

        /// Where `calltrace stop` writes the trace document
        #[arg(short, long, default_value = DEFAULT_TRACE_PATH)]
        output: PathBuf,
    },

    /// Trace a program from start to exit without interaction
    Trace {
        /// Path to the executable binary
        binary: String,

        /// Regex selecting the functions to trace
        #[arg(short = 'e', long)]
        pattern: Option<String>,

        /// Where the trace document is written
        #[arg(short, long, default_value = DEFAULT_TRACE_PATH)]
        output: PathBuf,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print a saved trace document as a call tree
    Show {
        /// Path to the trace document
        #[arg(default_value = DEFAULT_TRACE_PATH)]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = cli.options.to_config();
    match cli.command {
        DebugCommand::Run {
            binary,
            output,
            args,
        } => {
            let mut debugger = Debugger::new(TraceConfig {
                output_path: output,
                ..config
            });
            launch(&mut debugger, &binary, &args)?;
            repl::run(&mut debugger)
        }
        DebugCommand::Attach {
            binary,
            pid,
            output,
        } => {
            let mut debugger = Debugger::new(TraceConfig {
                output_path: output,
                ..config
            });
            println!("Loading binary: {}", binary);
            debugger.load_binary(&binary)?;
            debugger.attach(pid)?;
            println!("Attached to process {}", pid);
            println!();
            repl::run(&mut debugger)
        }
        DebugCommand::Trace {
            binary,
            pattern,
            output,
            args,
        } => trace(
            TraceConfig {
                output_path: output,
                ..config
            },
            &binary,
            &args,
            pattern.as_deref(),
        ),
        DebugCommand::Show { path } => show(&path),
    }
}

/// ログ出力を初期化する
///
/// `--log-level` が最優先で、次に `RUST_LOG`、どちらも無ければ `warn`。
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// バイナリを読み込んでプロセスを起動する
fn launch(debugger: &mut Debugger, binary: &str, args: &[String]) -> Result<()> {
    println!("Loading binary: {}", binary);
    debugger.load_binary(binary)?;
    debugger.spawn(binary, args)?;
    tracing::info!(binary, pid = ?debugger.pid(), "process launched");
    println!("Process spawned and stopped at first instruction");
    println!("Use 'calltrace start [pattern]' then 'continue' to record calls");
    println!();
    Ok(())
}

/// 非対話でトレースする
fn trace(config: TraceConfig, binary: &str, args: &[String], pattern: Option<&str>) -> Result<()> {
    let output = config.output_path.clone();
    let mut debugger = Debugger::new(config);
    launch(&mut debugger, binary, args)?;

    let inserted = debugger.start_trace(pattern)?;
    println!("Tracing {} function(s)", inserted);

    let reason = debugger.run_until_exit()?;
    tracing::debug!(?reason, calls = debugger.status().calls, "debuggee finished");
    println!("{}", repl::describe_stop(&reason));

    let document = debugger.stop_trace()?;
    println!();
    print!("{}", render_tree(&document));
    println!();
    println!("Trace written to {}", output.display());
    Ok(())
}

/// 保存済みのトレース文書を表示する
fn show(path: &std::path::Path) -> Result<()> {
    let document = TraceDocument::read_from(path)
        .with_context(|| format!("Failed to read trace document {}", path.display()))?;
    print!("{}", render_tree(&document));
    if let Some(call) = document.failing_call() {
        println!();
        println!(
            "Failed in #{} {} ({}:{})",
            call.call_id, call.function, call.file, call.line
        );
        if let Some(message) = &call.error_message {
            println!("  {}", message);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trace_subcommand() {
        let cli = Cli::try_parse_from([
            "calltrace",
            "trace",
            "./app",
            "--pattern",
            "^app::",
            "--output",
            "/tmp/out.json",
            "--",
            "--flag",
            "x",
        ])
        .unwrap();

        match cli.command {
            DebugCommand::Trace {
                binary,
                pattern,
                output,
                args,
            } => {
                assert_eq!(binary, "./app");
                assert_eq!(pattern.as_deref(), Some("^app::"));
                assert_eq!(output, PathBuf::from("/tmp/out.json"));
                assert_eq!(args, vec!["--flag".to_string(), "x".to_string()]);
            }
            _ => panic!("expected trace"),
        }
    }

    #[test]
    fn test_show_defaults_to_well_known_path() {
        let cli = Cli::try_parse_from(["calltrace", "show"]).unwrap();
        match cli.command {
            DebugCommand::Show { path } => assert_eq!(path, PathBuf::from(DEFAULT_TRACE_PATH)),
            _ => panic!("expected show"),
        }
    }

    #[test]
    fn test_attach_requires_pid() {
        assert!(Cli::try_parse_from(["calltrace", "attach", "./app"]).is_err());
        assert!(Cli::try_parse_from(["calltrace", "attach", "./app", "--pid", "42"]).is_ok());
    }

    #[test]
    fn test_options_override_config() {
        let cli = Cli::try_parse_from([
            "calltrace",
            "--max-stack-depth",
            "8",
            "--no-retire",
            "--zero-as-unavailable",
            "--router",
            "^my::dispatch$",
            "show",
        ])
        .unwrap();
        let config = cli.options.to_config();
        assert_eq!(config.max_stack_depth, 8);
        assert!(!config.retire_returned);
        assert!(config.decode.zero_as_unavailable);
        assert!(config.skip_runtime_symbols);
        assert_eq!(config.extra_router_patterns, vec!["^my::dispatch$".to_string()]);
    }

    #[test]
    fn test_default_options_match_default_config() {
        let config = TraceOptions::default().to_config();
        let defaults = TraceConfig::default();
        assert_eq!(config.max_stack_depth, defaults.max_stack_depth);
        assert_eq!(config.retire_returned, defaults.retire_returned);
        assert_eq!(config.decode.max_depth, defaults.decode.max_depth);
    }
}
