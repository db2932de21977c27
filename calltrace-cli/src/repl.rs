//! 対話モード

use anyhow::Result;
use calltrace_core::{
    render_tree, Command, Debugger, DebuggerStatus, FrameInfo, StopReason, Symbol, HELP,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// `find` で表示するシンボルの上限
const FIND_LIMIT: usize = 20;

/// REPLループを実行する
pub fn run(debugger: &mut Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        match rl.readline("(calltrace) ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                match Command::parse(line) {
                    Some(Command::Quit) => break,
                    Some(command) => {
                        if let Err(e) = handle_command(debugger, command) {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    None => {
                        println!("Unknown command: {}", line);
                        println!("Type 'help' for available commands.");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn handle_command(debugger: &mut Debugger, command: Command) -> Result<()> {
    match command {
        Command::TraceStart(pattern) => {
            let inserted = debugger.start_trace(pattern.as_deref())?;
            let pattern = debugger.session().pattern().unwrap_or_default();
            println!("Tracing {} function(s) matching '{}'", inserted, pattern);
        }
        Command::TraceStop => {
            let document = debugger.stop_trace()?;
            print!("{}", render_tree(&document));
            println!(
                "Trace written to {}",
                debugger.config().output_path.display()
            );
        }
        Command::Continue => {
            println!("Continuing execution...");
            let reason = debugger.continue_and_wait()?;
            println!("{}", describe_stop(&reason));
        }
        Command::Backtrace => print_backtrace(&debugger.backtrace()?),
        Command::Find(pattern) => {
            let symbols = debugger.find(&pattern)?;
            let title = format!("Functions matching '{}'", pattern);
            print_symbol_list(&title, &symbols, Some(FIND_LIMIT));
        }
        Command::Status => print_status(&debugger.status()),
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

/// 停止理由の説明文
pub fn describe_stop(reason: &StopReason) -> String {
    match reason {
        StopReason::Exited(code) => format!("Process exited with code {}", code),
        StopReason::Signal(signal) => format!("Process stopped by signal {}", signal),
        StopReason::Exception(message) => format!("Process stopped: {}", message),
        StopReason::Breakpoint => "Process stopped at a breakpoint".to_string(),
        StopReason::Running => "Process is running".to_string(),
    }
}

/// シンボルリストを表示するヘルパー関数
fn print_symbol_list(title: &str, symbols: &[Symbol], limit: Option<usize>) {
    if symbols.is_empty() {
        println!("No {} found", title);
        return;
    }

    let display_limit = limit.unwrap_or(symbols.len());
    println!("{} ({} found):", title, symbols.len());

    for (i, sym) in symbols.iter().take(display_limit).enumerate() {
        if sym.size > 0 {
            println!(
                "  {}. {} @ 0x{:x} (size: {})",
                i + 1,
                sym.display_name(),
                sym.address,
                sym.size
            );
        } else {
            println!("  {}. {} @ 0x{:x}", i + 1, sym.display_name(), sym.address);
        }
    }

    if symbols.len() > display_limit {
        println!("  ... and {} more", symbols.len() - display_limit);
    }
}

fn print_backtrace(frames: &[FrameInfo]) {
    if frames.is_empty() {
        println!("No frames");
        return;
    }
    for frame in frames {
        let function = frame.function.as_deref().unwrap_or("??");
        match &frame.location {
            Some(location) => println!(
                "  #{} 0x{:016x} {} at {}:{}",
                frame.index, frame.pc, function, location.file, location.line
            ),
            None => println!("  #{} 0x{:016x} {}", frame.index, frame.pc, function),
        }
    }
}

fn print_status(status: &DebuggerStatus) {
    match status.pid {
        Some(pid) if status.alive => println!("Process: {} (alive)", pid),
        Some(pid) => println!("Process: {} (not running)", pid),
        None => println!("Process: none"),
    }
    println!("Last stop: {}", describe_stop(&status.last_stop));
    if status.trace_active {
        println!(
            "Trace: active, pattern '{}'",
            status.pattern.as_deref().unwrap_or_default()
        );
    } else {
        println!("Trace: inactive");
    }
    println!(
        "Breakpoints: {} entry, {} panic",
        status.entry_breakpoints, status.panic_breakpoints
    );
    println!("Calls recorded: {} ({} thread(s))", status.calls, status.threads);
    if let Some(error) = &status.error {
        println!("Error: {}", error);
    }
}
