//! DWARFレジスタ番号（x86_64 System V）

/// DWARFレジスタ番号
pub const RAX: u16 = 0;
pub const RDX: u16 = 1;
pub const RCX: u16 = 2;
pub const RBX: u16 = 3;
pub const RSI: u16 = 4;
pub const RDI: u16 = 5;
pub const RBP: u16 = 6;
pub const RSP: u16 = 7;
pub const R8: u16 = 8;
pub const R9: u16 = 9;
/// 戻りアドレス（RIP）
pub const RA: u16 = 16;

const REGISTER_COUNT: usize = 17;

/// DWARFレジスタ番号で引けるレジスタ値の集合
///
/// 巻き戻した外側のフレームでは、復元できたレジスタだけが値を持つ。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DwarfRegisters {
    values: [Option<u64>; REGISTER_COUNT],
}

impl DwarfRegisters {
    /// 空のレジスタ集合を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// レジスタ値を取得する
    pub fn get(&self, reg: u16) -> Option<u64> {
        self.values.get(reg as usize).copied().flatten()
    }

    /// レジスタ値を設定する（範囲外の番号は無視する）
    pub fn set(&mut self, reg: u16, value: u64) {
        if let Some(slot) = self.values.get_mut(reg as usize) {
            *slot = Some(value);
        }
    }

    /// レジスタ値を未知にする
    pub fn clear(&mut self, reg: u16) {
        if let Some(slot) = self.values.get_mut(reg as usize) {
            *slot = None;
        }
    }

    pub fn pc(&self) -> Option<u64> {
        self.get(RA)
    }

    pub fn sp(&self) -> Option<u64> {
        self.get(RSP)
    }

    pub fn fp(&self) -> Option<u64> {
        self.get(RBP)
    }

    /// 呼び出し規約の整数引数レジスタ（rdi, rsi, rdx, rcx, r8, r9）
    pub fn argument_registers(&self) -> Vec<u64> {
        [RDI, RSI, RDX, RCX, R8, R9]
            .iter()
            .map_while(|reg| self.get(*reg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut regs = DwarfRegisters::new();
        regs.set(RSP, 0x7fff_0000);
        regs.set(RA, 0x401000);
        regs.set(99, 1);
        assert_eq!(regs.sp(), Some(0x7fff_0000));
        assert_eq!(regs.pc(), Some(0x401000));
        assert_eq!(regs.fp(), None);
        assert_eq!(regs.get(99), None);

        regs.clear(RSP);
        assert_eq!(regs.sp(), None);
    }

    #[test]
    fn test_argument_registers_stop_at_unknown() {
        let mut regs = DwarfRegisters::new();
        regs.set(RDI, 1);
        regs.set(RSI, 2);
        regs.set(RCX, 4);
        assert_eq!(regs.argument_registers(), vec![1, 2]);
    }
}
