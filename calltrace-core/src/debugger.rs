//! デバッガのメインロジック
//!
//! プロセス制御・DWARF情報・トレースセッションをつなぎます。トレース中は
//! エントリとパニック入口のブレークポイントで止まるたびにエンジンへ
//! イベントを渡し、ブレークポイントをステップオーバーして実行を続けます。

use crate::breakpoint::{Breakpoint, BreakpointKind, BreakpointManager};
use crate::errors::{ERR_BINARY_NOT_LOADED, ERR_NOT_ATTACHED, ERR_NO_STOPPED_THREAD, ERR_PROCESS_EXITED};
use crate::frames::HostStack;
use crate::image::{AddressSpace, Image};
use crate::memory::HostMemory;
use crate::Result;
use calltrace_dwarf::{Symbol, UnwindFrame};
use calltrace_engine::{
    FrameInfo, PanicEvent, StopEvent, StopReason, Tid, TraceConfig, TraceDocument, TraceError,
    TraceSession,
};
use calltrace_target::registers::{argument_registers, to_dwarf_registers};
use calltrace_target::{Memory, Process, Registers, StopKind, ThreadId};
use nix::libc::user_regs_struct;
use nix::sys::signal::Signal;
use regex::Regex;
use std::path::Path;

/// プロセスを終わらせるシグナルか
fn is_fatal(signal: i32) -> bool {
    matches!(
        Signal::try_from(signal),
        Ok(Signal::SIGSEGV | Signal::SIGABRT | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE)
    )
}

/// デバッガの状態の要約
#[derive(Debug, Clone)]
pub struct DebuggerStatus {
    pub pid: Option<i32>,
    pub alive: bool,
    pub last_stop: StopReason,
    pub trace_active: bool,
    pub pattern: Option<String>,
    pub entry_breakpoints: usize,
    pub panic_breakpoints: usize,
    pub calls: usize,
    pub threads: usize,
    pub error: Option<String>,
}

/// デバッガ
pub struct Debugger {
    /// デバッグ対象プロセス
    process: Option<Process>,
    /// メモリアクセス
    memory: Option<Memory>,
    /// 実行可能ファイルと共有ライブラリ
    space: Option<AddressSpace>,
    /// トレース用ブレークポイント
    breakpoints: BreakpointManager,
    session: TraceSession,
    /// 最後の停止理由
    last_stop: StopReason,
    /// 最後に停止したスレッド
    last_tid: Option<ThreadId>,
    /// 次の再開時にスレッドへ渡し直すシグナル
    pending_signal: Option<(ThreadId, i32)>,
}

impl Debugger {
    /// 新しいデバッガを作成する
    pub fn new(config: TraceConfig) -> Self {
        Self {
            process: None,
            memory: None,
            space: None,
            breakpoints: BreakpointManager::new(),
            session: TraceSession::new(config),
            last_stop: StopReason::Running,
            last_tid: None,
            pending_signal: None,
        }
    }

    /// トレースセッション
    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    /// トレース設定
    pub fn config(&self) -> &TraceConfig {
        self.session.config()
    }

    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスはexecve直後に停止状態で開始されます。
    pub fn spawn<P: AsRef<Path>>(&mut self, program: P, args: &[String]) -> Result<()> {
        let process = Process::spawn(program, args)?;
        self.install(process)
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let process = Process::attach(pid)?;
        self.install(process)
    }

    fn install(&mut self, process: Process) -> Result<()> {
        let pid = process.pid();
        let memory = Memory::new(pid);
        self.breakpoints.clear();
        self.pending_signal = None;
        self.last_stop = StopReason::Running;
        self.last_tid = Some(pid);
        self.process = Some(process);
        self.memory = Some(memory);

        if let Some(space) = self.space.as_mut() {
            space.reset();
            space.refresh(&memory.mappings()?);
        }
        tracing::info!(pid, "debuggee ready");
        Ok(())
    }

    /// ELFバイナリからシンボルとDWARF情報を読み込む
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut space = AddressSpace::new(Image::load(path)?);
        if let Some(memory) = self.memory.filter(|_| self.is_alive()) {
            space.refresh(&memory.mappings()?);
        }
        self.space = Some(space);
        Ok(())
    }

    /// 実行可能ファイルの情報
    pub fn binary(&self) -> Option<&Image> {
        self.space.as_ref().map(AddressSpace::main)
    }

    /// プロセスID
    pub fn pid(&self) -> Option<i32> {
        self.process.as_ref().map(Process::pid)
    }

    /// プロセスが生存しているか
    pub fn is_alive(&self) -> bool {
        self.process.as_ref().is_some_and(|p| !p.has_exited())
    }

    /// 最後の停止理由
    pub fn last_stop(&self) -> &StopReason {
        &self.last_stop
    }

    /// すべてのブレークポイント
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.all()
    }

    /// 正規表現にマッチする関数シンボルを探す
    pub fn find(&self, pattern: &str) -> Result<Vec<Symbol>> {
        let image = self
            .binary()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))?;
        let regex = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("Invalid pattern '{}': {}", pattern, e))?;
        Ok(image
            .symbols()
            .find_functions(&regex)
            .into_iter()
            .cloned()
            .collect())
    }

    /// トレースを開始する
    ///
    /// パニック入口と、パターンにマッチする関数のエントリにブレークポイントを置く。
    /// 置いたエントリブレークポイントの数を返す。
    pub fn start_trace(&mut self, pattern: Option<&str>) -> Result<usize> {
        let alive = self.is_alive();
        let (Some(space), Some(memory)) = (self.space.as_ref(), self.memory) else {
            return Err(TraceError::NoTarget(ERR_NOT_ATTACHED.to_string()).into());
        };
        if !alive {
            return Err(TraceError::NoTarget(ERR_PROCESS_EXITED.to_string()).into());
        }

        let pattern = pattern
            .unwrap_or(self.session.config().default_pattern.as_str())
            .to_string();
        let regex = Regex::new(&pattern).map_err(|source| TraceError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        self.breakpoints.remove_all(&memory)?;

        let main = space.main();
        let correlator = self.session.correlator();
        let mut panics = 0;
        for symbol in main
            .symbols()
            .all_symbols()
            .filter(|s| correlator.is_panic_entry(s.display_name()))
        {
            let address = main.runtime_address(symbol.address);
            match self
                .breakpoints
                .add_and_enable(address, BreakpointKind::Panic, symbol.display_name(), &memory)
            {
                Ok(true) => panics += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(function = symbol.display_name(), error = %e, "could not insert panic breakpoint"),
            }
        }

        let filter = self.session.filter();
        let skip_runtime = self.session.config().skip_runtime_symbols;
        let mut entries = 0;
        for symbol in main.symbols().find_functions(&regex) {
            let name = symbol.display_name();
            if skip_runtime && filter.is_runtime(name) {
                continue;
            }
            let address = main.runtime_address(main.entry_address(symbol));
            match self
                .breakpoints
                .add_and_enable(address, BreakpointKind::Entry, name, &memory)
            {
                Ok(true) => entries += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(function = name, error = %e, "could not insert entry breakpoint"),
            }
        }

        if entries == 0 {
            self.breakpoints.remove_all(&memory)?;
            return Err(TraceError::BreakpointFailed(pattern).into());
        }

        self.session.start(Some(&pattern))?;
        tracing::info!(pattern = %pattern, entries, panics, "trace started");
        Ok(entries)
    }

    /// トレースを停止し、文書を設定の出力先に書き出す
    pub fn stop_trace(&mut self) -> Result<TraceDocument> {
        if !self.session.is_active() {
            return Err(TraceError::NotActive.into());
        }
        match self.memory.filter(|_| self.is_alive()) {
            Some(memory) => self.breakpoints.remove_all(&memory)?,
            None => self.breakpoints.clear(),
        }

        let event = StopEvent::new(self.last_stop.clone());
        Ok(self.session.stop_and_write(&event)?)
    }

    /// 終了するか致命的なシグナルを受けるまで実行する
    ///
    /// トレース用のブレークポイントでは止まらずに実行を続ける。致命的なシグナルで
    /// 止まった場合、次の再開でそのシグナルを渡し直す。
    pub fn continue_and_wait(&mut self) -> Result<StopReason> {
        if !self.is_alive() {
            anyhow::bail!(if self.process.is_some() {
                ERR_PROCESS_EXITED
            } else {
                ERR_NOT_ATTACHED
            });
        }
        self.resume()?;

        loop {
            let stop = self.process_mut()?.wait_any()?;
            self.last_tid = Some(stop.tid);

            let outcome = match stop.kind {
                StopKind::Trap => self.handle_trap(stop.tid)?,
                StopKind::Signal(signal) if signal == Signal::SIGSTOP as i32 => None,
                StopKind::Signal(signal) if is_fatal(signal) => {
                    self.pending_signal = Some((stop.tid, signal));
                    self.report_fatal(stop.tid, signal);
                    Some(StopReason::Signal(signal))
                }
                StopKind::Signal(signal) => {
                    tracing::debug!(tid = stop.tid, signal, "forwarding signal");
                    self.pending_signal = Some((stop.tid, signal));
                    None
                }
                StopKind::Exited(code) => Some(StopReason::Exited(code)),
                StopKind::Killed(signal) => Some(StopReason::Signal(signal)),
            };

            if let Some(reason) = outcome {
                if !self.is_alive() {
                    self.breakpoints.clear();
                }
                tracing::info!(?reason, "debuggee stopped");
                self.last_stop = reason.clone();
                return Ok(reason);
            }
            self.resume()?;
        }
    }

    /// プロセスが終了するまで実行する
    pub fn run_until_exit(&mut self) -> Result<StopReason> {
        loop {
            let reason = self.continue_and_wait()?;
            if !self.is_alive() {
                return Ok(reason);
            }
        }
    }

    /// 最後に停止したスレッドのバックトレース
    pub fn backtrace(&mut self) -> Result<Vec<FrameInfo>> {
        if !self.is_alive() {
            anyhow::bail!(ERR_NO_STOPPED_THREAD);
        }
        let tid = self
            .last_tid
            .ok_or_else(|| anyhow::anyhow!(ERR_NO_STOPPED_THREAD))?;
        let regs = Registers::new(tid).read()?;
        let frames = self.unwind_from(&regs)?;
        let stack = self.host_stack(frames, argument_registers(&regs))?;
        Ok(stack.frames())
    }

    /// 状態の要約
    pub fn status(&self) -> DebuggerStatus {
        let execution = self.session.status();
        DebuggerStatus {
            pid: self.pid(),
            alive: self.is_alive(),
            last_stop: self.last_stop.clone(),
            trace_active: self.session.is_active(),
            pattern: self.session.pattern(),
            entry_breakpoints: self.breakpoints.count_of(BreakpointKind::Entry),
            panic_breakpoints: self.breakpoints.count_of(BreakpointKind::Panic),
            calls: self.session.records().len(),
            threads: self.session.thread_count(),
            error: execution.error_message.filter(|_| execution.is_error),
        }
    }

    fn process_mut(&mut self) -> Result<&mut Process> {
        self.process
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))
    }

    /// 停止中のスレッドをすべて再開する
    fn resume(&mut self) -> Result<()> {
        let pending = self.pending_signal.take();
        let process = self.process_mut()?;
        if let Some((tid, signal)) = pending {
            process.resume(tid, Some(signal))?;
        }
        process.resume_all()
    }

    /// SIGTRAPを処理する
    ///
    /// トレース用ブレークポイントならイベントを渡してステップオーバーする。
    /// ステップ中にプロセスが終了したらその停止理由を返す。
    fn handle_trap(&mut self, tid: ThreadId) -> Result<Option<StopReason>> {
        let registers = Registers::new(tid);
        let mut regs = registers.read()?;
        let address = regs.rip.wrapping_sub(1);
        let Some(kind) = self.breakpoints.hit(address).map(|bp| bp.kind) else {
            tracing::trace!(tid, "trap without breakpoint");
            return Ok(None);
        };

        regs.rip = address;
        registers.write(regs)?;
        if let Err(e) = self.dispatch(tid, kind, &regs) {
            tracing::warn!(tid, ?kind, error = %e, "could not inspect breakpoint hit");
        }
        self.step_over(tid, address)
    }

    /// ブレークポイントのヒットをエンジンに渡す
    fn dispatch(&mut self, tid: ThreadId, kind: BreakpointKind, regs: &user_regs_struct) -> Result<()> {
        let frames = self.unwind_from(regs)?;
        let stack = self.host_stack(frames, argument_registers(regs))?;
        match kind {
            BreakpointKind::Entry => {
                if let Some(call_id) = self.session.on_entry(Tid(tid), &stack) {
                    tracing::trace!(tid, call_id, "entry recorded");
                }
            }
            BreakpointKind::Panic => {
                let memory = self
                    .memory
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
                let event = PanicEvent {
                    tid: Tid(tid),
                    stack: &stack,
                    memory: &HostMemory::new(memory),
                };
                if self.session.on_panic(&event) {
                    tracing::info!(tid, "panic recorded");
                }
            }
        }
        Ok(())
    }

    /// 元の命令を1つ実行してブレークポイントを戻す
    fn step_over(&mut self, tid: ThreadId, address: u64) -> Result<Option<StopReason>> {
        let memory = self
            .memory
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        self.breakpoints.suspend(address, &memory)?;

        let outcome = self.process_mut()?.step_thread(tid)?;
        match outcome {
            StopKind::Exited(code) => return Ok(Some(StopReason::Exited(code))),
            StopKind::Killed(signal) => return Ok(Some(StopReason::Signal(signal))),
            StopKind::Signal(signal) if signal != Signal::SIGSTOP as i32 => {
                self.pending_signal = Some((tid, signal));
            }
            _ => {}
        }
        self.breakpoints.resume(address, &memory)?;
        Ok(None)
    }

    /// 致命的なシグナルをスタック付きでエンジンに渡す
    fn report_fatal(&mut self, tid: ThreadId, signal: i32) {
        let result = Registers::new(tid).read().and_then(|regs| {
            let frames = self.unwind_from(&regs)?;
            let stack = self.host_stack(frames, argument_registers(&regs))?;
            let event = StopEvent::new(StopReason::Signal(signal)).with_stack(&stack);
            Ok(self.session.on_stop(&event))
        });
        match result {
            Ok(latched) => tracing::info!(tid, signal, latched, "fatal signal"),
            Err(e) => tracing::warn!(tid, signal, error = %e, "could not inspect fatal signal"),
        }
    }

    /// レジスタからスタックを巻き戻す
    ///
    /// エンジンがスタックの終端に届いたかを判定できるよう、最大深さより1つ多く巻き戻す。
    fn unwind_from(&mut self, regs: &user_regs_struct) -> Result<Vec<UnwindFrame>> {
        let memory = self
            .memory
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        let max_frames = self.session.config().max_stack_depth + 1;
        let space = self
            .space
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))?;
        Ok(space.unwind(&to_dwarf_registers(regs), &memory, max_frames))
    }

    fn host_stack(&self, frames: Vec<UnwindFrame>, entry_registers: Vec<u64>) -> Result<HostStack<'_>> {
        let space = self
            .space
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))?;
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        Ok(HostStack::new(space, memory, frames, entry_registers))
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new(TraceConfig::default())
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        // デタッチ後の対象にINT3を残さない
        if let Some(memory) = self.memory.filter(|_| self.is_alive()) {
            if let Err(e) = self.breakpoints.remove_all(&memory) {
                tracing::warn!(error = %e, "could not remove breakpoints");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_signals() {
        assert!(is_fatal(Signal::SIGSEGV as i32));
        assert!(is_fatal(Signal::SIGABRT as i32));
        assert!(!is_fatal(Signal::SIGCHLD as i32));
        assert!(!is_fatal(Signal::SIGSTOP as i32));
        assert!(!is_fatal(0));
    }

    #[test]
    fn test_start_without_target() {
        let mut debugger = Debugger::default();
        let err = debugger.start_trace(None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::NoTarget(_))
        ));
        assert!(!debugger.session().is_active());
    }

    #[test]
    fn test_stop_without_trace() {
        let mut debugger = Debugger::default();
        let err = debugger.stop_trace().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::NotActive)
        ));
    }

    #[test]
    fn test_continue_without_process() {
        let mut debugger = Debugger::default();
        let err = debugger.continue_and_wait().unwrap_err();
        assert_eq!(err.to_string(), ERR_NOT_ATTACHED);
        assert!(debugger.backtrace().is_err());
    }

    #[test]
    fn test_find_without_binary() {
        let debugger = Debugger::default();
        assert!(debugger.find("main").is_err());
    }
}
