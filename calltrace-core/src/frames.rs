//! 停止したスレッドのコールスタック
//!
//! 巻き戻したフレームに、関数名・ソース位置・引数値を付けてエンジンに見せます。

use crate::image::AddressSpace;
use crate::value::DwarfValue;
use calltrace_dwarf::{FrameState, MemoryReader, ParameterLocator, UnwindFrame};
use calltrace_engine::{FrameInfo, ThreadStack, ValueView};

/// 停止したスレッドのスタック
pub struct HostStack<'a> {
    space: &'a AddressSpace,
    memory: &'a dyn MemoryReader,
    frames: Vec<UnwindFrame>,
    entry_registers: Vec<u64>,
}

impl<'a> HostStack<'a> {
    /// 巻き戻し済みのフレームからスタックを作る
    ///
    /// `entry_registers` は停止時点の整数引数レジスタ。
    pub fn new(
        space: &'a AddressSpace,
        memory: &'a dyn MemoryReader,
        frames: Vec<UnwindFrame>,
        entry_registers: Vec<u64>,
    ) -> Self {
        Self {
            space,
            memory,
            frames,
            entry_registers,
        }
    }

    /// フレーム数
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// 全フレームの情報
    pub fn frames(&self) -> Vec<FrameInfo> {
        (0..self.frames.len()).filter_map(|i| self.frame(i)).collect()
    }

    /// シンボル解決に使うアドレス
    ///
    /// 外側のフレームのPCは呼び出し命令の直後を指すので1つ戻す。
    fn lookup_pc(index: usize, pc: u64) -> u64 {
        if index == 0 {
            pc
        } else {
            pc.saturating_sub(1)
        }
    }
}

impl ThreadStack for HostStack<'_> {
    fn frame(&self, index: usize) -> Option<FrameInfo> {
        let frame = self.frames.get(index)?;
        let lookup = Self::lookup_pc(index, frame.pc);
        let image = self.space.image_for(lookup);
        Some(FrameInfo {
            index,
            function: image.and_then(|image| image.function_name(lookup)),
            location: image.and_then(|image| image.location(lookup)),
            pc: frame.pc,
        })
    }

    fn arguments(&self, index: usize) -> Vec<Box<dyn ValueView + '_>> {
        let Some(frame) = self.frames.get(index) else {
            return Vec::new();
        };
        let lookup = Self::lookup_pc(index, frame.pc);
        let Some(image) = self.space.image_for(lookup) else {
            return Vec::new();
        };
        let (Some(info), Some(function)) = (image.debug_info(), image.function_at(lookup)) else {
            return Vec::new();
        };

        let locator = ParameterLocator::new(info);
        let parameters = match locator.parameters(function) {
            Ok(parameters) => parameters,
            Err(e) => {
                tracing::debug!(function = %function.name, error = %e, "could not list parameters");
                return Vec::new();
            }
        };

        let state = FrameState {
            pc: image.file_address(lookup),
            registers: frame.registers.clone(),
            cfa: frame.cfa,
            memory: self.memory,
        };
        parameters
            .into_iter()
            .map(|parameter| {
                let value = match locator.read_value(function, &parameter, &state) {
                    Some((bytes, address)) => DwarfValue::new(
                        parameter.name,
                        parameter.type_info,
                        Some(bytes),
                        address,
                        self.memory,
                    ),
                    None => {
                        DwarfValue::unavailable(parameter.name, parameter.type_info, self.memory)
                    }
                };
                Box::new(value) as Box<dyn ValueView + '_>
            })
            .collect()
    }

    fn entry_registers(&self) -> Vec<u64> {
        self.entry_registers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_pc() {
        assert_eq!(HostStack::lookup_pc(0, 0x1000), 0x1000);
        assert_eq!(HostStack::lookup_pc(3, 0x1000), 0xfff);
        assert_eq!(HostStack::lookup_pc(1, 0), 0);
    }
}
