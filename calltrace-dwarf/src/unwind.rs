//! スタックの巻き戻し
//!
//! 各イメージの `.eh_frame` を使ってCFIで1フレームずつ巻き戻します。
//! CFIが見つからない場合はフレームポインタ（rbp）の連鎖をたどります。

use crate::registers::{self, RA, RBP, RSP};
use crate::{DwarfLoader, DwarfReader, DwarfRegisters, MemoryReader, Result};
use gimli::{BaseAddresses, CfaRule, EhFrame, RegisterRule, UnwindContext, UnwindSection};

/// 巻き戻しで復元を試みるレジスタ（呼び出し先保存）
const CALLEE_SAVED: &[u16] = &[registers::RBX, RBP, 12, 13, 14, 15];

/// 巻き戻したフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindFrame {
    /// 実行時のPC
    pub pc: u64,
    /// このフレームのCFA（わかれば）
    pub cfa: Option<u64>,
    /// このフレームで復元できたレジスタ
    pub registers: DwarfRegisters,
}

/// 1つのイメージのCFI
struct ImageCfi {
    /// 実行時のアドレス範囲
    start: u64,
    end: u64,
    /// ロードバイアス（実行時アドレス - ファイル上のアドレス）
    bias: u64,
    eh_frame: EhFrame<DwarfReader>,
    bases: BaseAddresses,
}

/// スタック巻き戻し器
#[derive(Default)]
pub struct Unwinder {
    images: Vec<ImageCfi>,
}

impl Unwinder {
    /// 空の巻き戻し器を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// イメージの `.eh_frame` を登録する
    ///
    /// `range` は実行時にマップされているアドレス範囲。
    pub fn add_image(&mut self, loader: &DwarfLoader, bias: u64, range: (u64, u64)) -> bool {
        let Some((data, eh_frame_addr)) = loader.section(".eh_frame") else {
            tracing::debug!(path = %loader.path().display(), "no .eh_frame");
            return false;
        };
        let mut bases = BaseAddresses::default().set_eh_frame(eh_frame_addr);
        if let Some((_, text_addr)) = loader.section(".text") {
            bases = bases.set_text(text_addr);
        }
        let mut eh_frame = EhFrame::new(data, loader.endian());
        eh_frame.set_address_size(8);

        self.images.push(ImageCfi {
            start: range.0,
            end: range.1,
            bias,
            eh_frame,
            bases,
        });
        true
    }

    /// 登録済みのイメージ数
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// アドレスを含むイメージが登録済みか
    pub fn covers(&self, pc: u64) -> bool {
        self.image_for(pc).is_some()
    }

    fn image_for(&self, pc: u64) -> Option<&ImageCfi> {
        self.images.iter().find(|image| pc >= image.start && pc < image.end)
    }

    /// 最大 `max_frames` フレームまで巻き戻す
    ///
    /// PCが0になるか、スタックポインタが進まなくなったら止める。
    pub fn unwind(
        &self,
        initial: &DwarfRegisters,
        memory: &dyn MemoryReader,
        max_frames: usize,
    ) -> Vec<UnwindFrame> {
        let mut frames = Vec::new();
        let mut regs = initial.clone();

        while frames.len() < max_frames {
            let Some(pc) = regs.pc().filter(|pc| *pc != 0) else {
                break;
            };
            // 外側のフレームの戻りアドレスは呼び出し命令の直後を指す
            let lookup = if frames.is_empty() { pc } else { pc - 1 };

            let step = match self.step_cfi(&regs, lookup, memory) {
                Ok(Some(step)) => Some(step),
                Ok(None) => self.step_frame_pointer(&regs, memory),
                Err(e) => {
                    tracing::trace!(pc = format_args!("0x{:x}", pc), error = %e, "cfi step failed");
                    self.step_frame_pointer(&regs, memory)
                }
            };

            let Some((cfa, next)) = step else {
                frames.push(UnwindFrame {
                    pc,
                    cfa: None,
                    registers: regs,
                });
                break;
            };
            let advanced = match (next.sp(), regs.sp()) {
                (Some(next_sp), Some(sp)) => next_sp > sp,
                _ => false,
            };
            frames.push(UnwindFrame {
                pc,
                cfa: Some(cfa),
                registers: regs,
            });
            if !advanced {
                break;
            }
            regs = next;
        }
        frames
    }

    /// CFIで1フレーム巻き戻す
    fn step_cfi(
        &self,
        regs: &DwarfRegisters,
        lookup: u64,
        memory: &dyn MemoryReader,
    ) -> Result<Option<(u64, DwarfRegisters)>> {
        let Some(image) = self.image_for(lookup) else {
            return Ok(None);
        };
        let address = lookup.wrapping_sub(image.bias);

        let mut ctx: UnwindContext<usize> = UnwindContext::new();
        let row = match image.eh_frame.unwind_info_for_address(
            &image.bases,
            &mut ctx,
            address,
            EhFrame::cie_from_offset,
        ) {
            Ok(row) => row,
            Err(gimli::Error::NoUnwindInfoForAddress) => return Ok(None),
            Err(e) => return Err(anyhow::anyhow!("Failed to evaluate unwind row: {}", e)),
        };

        let cfa = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = regs
                    .get(register.0)
                    .ok_or_else(|| anyhow::anyhow!("missing register {} for CFA", register.0))?;
                base.wrapping_add_signed(*offset)
            }
            CfaRule::Expression(_) => return Ok(None),
        };

        let Some(return_address) = evaluate_rule(&row.register(gimli::X86_64::RA), regs, cfa, memory)
        else {
            return Ok(None);
        };

        let mut next = DwarfRegisters::new();
        next.set(RA, return_address);
        next.set(RSP, cfa);
        for reg in CALLEE_SAVED {
            let rule = row.register(gimli::Register(*reg));
            let value = match rule {
                RegisterRule::Undefined | RegisterRule::SameValue => regs.get(*reg),
                _ => evaluate_rule(&rule, regs, cfa, memory),
            };
            if let Some(value) = value {
                next.set(*reg, value);
            }
        }
        Ok(Some((cfa, next)))
    }

    /// フレームポインタで1フレーム巻き戻す
    fn step_frame_pointer(
        &self,
        regs: &DwarfRegisters,
        memory: &dyn MemoryReader,
    ) -> Option<(u64, DwarfRegisters)> {
        let fp = regs.fp().filter(|fp| *fp != 0)?;
        let saved_fp = memory.read_u64(fp).ok()?;
        let return_address = memory.read_u64(fp.checked_add(8)?).ok()?;
        let cfa = fp.checked_add(16)?;

        let mut next = DwarfRegisters::new();
        next.set(RBP, saved_fp);
        next.set(RA, return_address);
        next.set(RSP, cfa);
        Some((cfa, next))
    }
}

/// レジスタの復元規則を評価する
fn evaluate_rule(
    rule: &RegisterRule<usize>,
    regs: &DwarfRegisters,
    cfa: u64,
    memory: &dyn MemoryReader,
) -> Option<u64> {
    match rule {
        RegisterRule::Offset(offset) => memory.read_u64(cfa.wrapping_add_signed(*offset)).ok(),
        RegisterRule::ValOffset(offset) => Some(cfa.wrapping_add_signed(*offset)),
        RegisterRule::Register(register) => regs.get(register.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FakeMemory;

    #[test]
    fn test_frame_pointer_chain() {
        // frame0: rbp=0x7000 -> [0x7000]=0x7100, [0x7008]=0x401234
        // frame1: rbp=0x7100 -> [0x7100]=0, [0x7108]=0x401500
        let memory = FakeMemory::default()
            .with_u64(0x7000, 0x7100)
            .with_u64(0x7008, 0x401234)
            .with_u64(0x7100, 0)
            .with_u64(0x7108, 0x401500);
        let mut regs = DwarfRegisters::new();
        regs.set(RA, 0x401000);
        regs.set(RSP, 0x6ff0);
        regs.set(RBP, 0x7000);

        let frames = Unwinder::new().unwind(&regs, &memory, 16);
        let pcs: Vec<u64> = frames.iter().map(|f| f.pc).collect();
        assert_eq!(pcs, vec![0x401000, 0x401234, 0x401500]);
        assert_eq!(frames[0].cfa, Some(0x7010));
        assert_eq!(frames[1].registers.sp(), Some(0x7010));
        assert_eq!(frames[2].cfa, None);
    }

    #[test]
    fn test_max_frames() {
        let memory = FakeMemory::default()
            .with_u64(0x7000, 0x7100)
            .with_u64(0x7008, 0x401234);
        let mut regs = DwarfRegisters::new();
        regs.set(RA, 0x401000);
        regs.set(RSP, 0x6ff0);
        regs.set(RBP, 0x7000);

        let frames = Unwinder::new().unwind(&regs, &memory, 1);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_stops_when_stack_does_not_advance() {
        // rbp がスタックポインタより下を指すと巻き戻しは進まない
        let memory = FakeMemory::default()
            .with_u64(0x1000, 0x1000)
            .with_u64(0x1008, 0x401234);
        let mut regs = DwarfRegisters::new();
        regs.set(RA, 0x401000);
        regs.set(RSP, 0x2000);
        regs.set(RBP, 0x1000);

        let frames = Unwinder::new().unwind(&regs, &memory, 16);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_zero_pc_stops() {
        let memory = FakeMemory::default();
        let frames = Unwinder::new().unwind(&DwarfRegisters::new(), &memory, 16);
        assert!(frames.is_empty());
    }
}
