//! プロセス制御機能
//!
//! ptrace で全スレッドを追跡します。`PTRACE_O_TRACECLONE` で新しいスレッドも
//! 自動的に追跡対象になり、その最初の SIGSTOP はここで吸収されます。

use crate::thread::{list_tasks, ThreadId, ThreadSet};
use crate::Result;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;
use std::path::Path;

/// スレッドが停止した理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// SIGTRAP（ブレークポイントまたはステップ完了）
    Trap,
    /// その他のシグナルを受けて停止した
    Signal(i32),
    /// プロセスが終了した
    Exited(i32),
    /// プロセスがシグナルで終了した
    Killed(i32),
}

/// 停止イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStop {
    pub tid: ThreadId,
    pub kind: StopKind,
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    /// 追跡中のスレッド
    threads: ThreadSet,
    /// 最初の SIGSTOP を待っている新しいスレッド
    pending: ThreadSet,
    /// ptrace-stop 中のスレッド
    stopped: ThreadSet,
    attached: bool,
    exited: bool,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// forkした子で PTRACE_TRACEME を設定してから execve する。
    /// execve 直後の停止状態で返る。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        use nix::unistd::{execve, fork, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid program path"))?;
        let program_cstring = CString::new(program_path)?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスから継承
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {}
                    status => {
                        return Err(anyhow::anyhow!(
                            "Unexpected wait status after execve: {:?}",
                            status
                        ))
                    }
                }
                ptrace::setoptions(child, Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_EXITKILL)?;

                let mut process = Self::empty(child, false);
                process.threads.insert(child.as_raw());
                process.stopped.insert(child.as_raw());
                tracing::info!(pid = child.as_raw(), program = %program_path, "spawned");
                Ok(process)
            }
            ForkResult::Child => {
                if ptrace::traceme().is_ok() {
                    let _ = execve(&program_cstring, &cstring_args, &env);
                }
                // execve が戻ってきたら失敗
                unsafe { nix::libc::_exit(127) }
            }
        }
    }

    /// 既存のプロセスの全スレッドにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        let mut process = Self::empty(Pid::from_raw(pid), true);
        for tid in list_tasks(pid)? {
            let thread = Pid::from_raw(tid);
            ptrace::attach(thread)
                .map_err(|e| anyhow::anyhow!("Failed to attach to thread {}: {}", tid, e))?;
            waitpid(thread, Some(WaitPidFlag::__WALL))?;
            ptrace::setoptions(thread, Options::PTRACE_O_TRACECLONE)?;
            process.threads.insert(tid);
            process.stopped.insert(tid);
        }
        tracing::info!(pid, threads = process.threads.len(), "attached");
        Ok(process)
    }

    fn empty(pid: Pid, attached: bool) -> Self {
        Self {
            pid,
            threads: ThreadSet::new(),
            pending: ThreadSet::new(),
            stopped: ThreadSet::new(),
            attached,
            exited: false,
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// 追跡中のスレッド
    pub fn threads(&self) -> &ThreadSet {
        &self.threads
    }

    /// プロセスが終了したか
    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// 停止中のスレッドを再開する
    pub fn resume(&mut self, tid: ThreadId, signal: Option<i32>) -> Result<()> {
        let signal = signal.map(Signal::try_from).transpose()?;
        ptrace::cont(Pid::from_raw(tid), signal)
            .map_err(|e| anyhow::anyhow!("Failed to resume thread {}: {}", tid, e))?;
        self.stopped.remove(tid);
        Ok(())
    }

    /// 停止中のスレッドをすべて再開する（シグナルなし）
    pub fn resume_all(&mut self) -> Result<()> {
        let stopped: Vec<ThreadId> = self.stopped.iter().collect();
        for tid in stopped {
            self.resume(tid, None)?;
        }
        Ok(())
    }

    /// いずれかのスレッドの次の停止を待つ
    ///
    /// スレッド生成イベントや新しいスレッドの最初の SIGSTOP、
    /// メインスレッド以外の終了はここで処理し、呼び出し側には返さない。
    pub fn wait_any(&mut self) -> Result<ThreadStop> {
        loop {
            let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))?;
            if let Some(stop) = self.handle_status(status)? {
                return Ok(stop);
            }
        }
    }

    /// 1スレッドだけを1命令実行する
    pub fn step_thread(&mut self, tid: ThreadId) -> Result<StopKind> {
        let thread = Pid::from_raw(tid);
        ptrace::step(thread, None)
            .map_err(|e| anyhow::anyhow!("Failed to single-step thread {}: {}", tid, e))?;
        self.stopped.remove(tid);
        loop {
            let status = waitpid(thread, Some(WaitPidFlag::__WALL))?;
            if let Some(stop) = self.handle_status(status)? {
                return Ok(stop.kind);
            }
        }
    }

    /// waitpid の結果を処理する。呼び出し側に返すべき停止なら `Some`。
    fn handle_status(&mut self, status: WaitStatus) -> Result<Option<ThreadStop>> {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) => {
                if event == nix::libc::PTRACE_EVENT_CLONE {
                    let new_tid = ptrace::getevent(pid)? as ThreadId;
                    if self.threads.insert(new_tid) {
                        self.pending.insert(new_tid);
                    }
                    tracing::debug!(parent = pid.as_raw(), tid = new_tid, "new thread");
                }
                ptrace::cont(pid, None)?;
                Ok(None)
            }
            WaitStatus::Stopped(pid, Signal::SIGSTOP)
                if self.pending.contains(pid.as_raw()) || !self.threads.contains(pid.as_raw()) =>
            {
                let tid = pid.as_raw();
                self.pending.remove(tid);
                self.threads.insert(tid);
                ptrace::cont(pid, None)?;
                Ok(None)
            }
            WaitStatus::Stopped(pid, signal) => {
                let tid = pid.as_raw();
                self.threads.insert(tid);
                self.pending.remove(tid);
                self.stopped.insert(tid);
                let kind = if signal == Signal::SIGTRAP {
                    StopKind::Trap
                } else {
                    StopKind::Signal(signal as i32)
                };
                Ok(Some(ThreadStop { tid, kind }))
            }
            WaitStatus::Exited(pid, code) => self.thread_gone(pid, StopKind::Exited(code)),
            WaitStatus::Signaled(pid, signal, _) => {
                self.thread_gone(pid, StopKind::Killed(signal as i32))
            }
            WaitStatus::PtraceSyscall(pid) => {
                ptrace::cont(pid, None)?;
                Ok(None)
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(None),
        }
    }

    /// スレッドの終了を処理する
    fn thread_gone(&mut self, pid: Pid, kind: StopKind) -> Result<Option<ThreadStop>> {
        let tid = pid.as_raw();
        self.threads.remove(tid);
        self.pending.remove(tid);
        self.stopped.remove(tid);
        if pid != self.pid {
            tracing::debug!(tid, "thread exited");
            return Ok(None);
        }
        self.exited = true;
        Ok(Some(ThreadStop { tid, kind }))
    }

    /// プロセスを強制終了する
    pub fn kill(&mut self) -> Result<()> {
        if self.exited {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)?;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        self.exited = true;
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if self.attached {
            for tid in self.threads.iter() {
                let _ = ptrace::detach(Pid::from_raw(tid), None);
            }
        } else {
            let _ = self.kill();
        }
    }
}
