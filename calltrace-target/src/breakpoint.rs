//! ブレークポイント機能

use crate::Result;

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// コードを1バイト単位で書き換える手段
pub trait CodePatch {
    fn read_byte(&self, addr: u64) -> Result<u8>;
    fn write_byte(&self, addr: u64, value: u8) -> Result<()>;
}

/// ソフトウェアブレークポイント（INT3命令）
#[derive(Debug, Clone)]
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 元のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// ブレークポイントを設定する
    ///
    /// 指定されたアドレスの命令を0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, code: &dyn CodePatch) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        self.original_byte = code.read_byte(self.address)?;
        code.write_byte(self.address, INT3_OPCODE)?;
        self.enabled = true;
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を元のバイトで置き換えます。
    pub fn disable(&mut self, code: &dyn CodePatch) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        code.write_byte(self.address, self.original_byte)?;
        self.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeCode {
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl CodePatch for FakeCode {
        fn read_byte(&self, addr: u64) -> Result<u8> {
            self.bytes
                .borrow()
                .get(&addr)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unmapped 0x{:x}", addr))
        }

        fn write_byte(&self, addr: u64, value: u8) -> Result<()> {
            self.bytes.borrow_mut().insert(addr, value);
            Ok(())
        }
    }

    #[test]
    fn test_enable_and_disable() {
        let code = FakeCode::default();
        code.write_byte(0x1000, 0x55).unwrap();

        let mut bp = SoftwareBreakpoint::new(0x1000);
        bp.enable(&code).unwrap();
        assert!(bp.is_enabled());
        assert_eq!(bp.original_byte(), 0x55);
        assert_eq!(code.read_byte(0x1000).unwrap(), INT3_OPCODE);

        // 二重に有効化しても元のバイトは上書きされない
        bp.enable(&code).unwrap();
        assert_eq!(bp.original_byte(), 0x55);

        bp.disable(&code).unwrap();
        assert!(!bp.is_enabled());
        assert_eq!(code.read_byte(0x1000).unwrap(), 0x55);
    }

    #[test]
    fn test_enable_unmapped_fails() {
        let code = FakeCode::default();
        let mut bp = SoftwareBreakpoint::new(0x2000);
        assert!(bp.enable(&code).is_err());
        assert!(!bp.is_enabled());
    }
}
