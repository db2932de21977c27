//! レジスタアクセス機能

use crate::{Result, ThreadId};
use calltrace_dwarf::registers as dw;
use calltrace_dwarf::DwarfRegisters;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;

/// スレッドのレジスタ
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// レジスタを読み取る
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = nix::sys::ptrace::getregs(self.tid)
            .map_err(|e| anyhow::anyhow!("Failed to read registers of {}: {}", self.tid, e))?;
        Ok(regs)
    }

    /// レジスタに書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        nix::sys::ptrace::setregs(self.tid, regs)
            .map_err(|e| anyhow::anyhow!("Failed to write registers of {}: {}", self.tid, e))?;
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        Ok(self.read()?.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }
}

/// 呼び出し規約の整数引数レジスタ（rdi, rsi, rdx, rcx, r8, r9）
pub fn argument_registers(regs: &user_regs_struct) -> Vec<u64> {
    vec![regs.rdi, regs.rsi, regs.rdx, regs.rcx, regs.r8, regs.r9]
}

/// DWARFレジスタ番号の集合に変換する
pub fn to_dwarf_registers(regs: &user_regs_struct) -> DwarfRegisters {
    let mut out = DwarfRegisters::new();
    for (reg, value) in [
        (dw::RAX, regs.rax),
        (dw::RDX, regs.rdx),
        (dw::RCX, regs.rcx),
        (dw::RBX, regs.rbx),
        (dw::RSI, regs.rsi),
        (dw::RDI, regs.rdi),
        (dw::RBP, regs.rbp),
        (dw::RSP, regs.rsp),
        (dw::R8, regs.r8),
        (dw::R9, regs.r9),
        (10, regs.r10),
        (11, regs.r11),
        (12, regs.r12),
        (13, regs.r13),
        (14, regs.r14),
        (15, regs.r15),
        (dw::RA, regs.rip),
    ] {
        out.set(reg, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> user_regs_struct {
        let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rdi = 1;
        regs.rsi = 2;
        regs.rdx = 3;
        regs.rcx = 4;
        regs.r8 = 5;
        regs.r9 = 6;
        regs.rsp = 0x7fff_0000;
        regs.rip = 0x401000;
        regs
    }

    #[test]
    fn test_argument_registers_order() {
        assert_eq!(argument_registers(&sample()), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_to_dwarf_registers() {
        let regs = to_dwarf_registers(&sample());
        assert_eq!(regs.pc(), Some(0x401000));
        assert_eq!(regs.sp(), Some(0x7fff_0000));
        assert_eq!(regs.get(dw::RDI), Some(1));
        assert_eq!(regs.get(dw::RCX), Some(4));
        assert_eq!(regs.argument_registers(), vec![1, 2, 3, 4, 5, 6]);
    }
}
