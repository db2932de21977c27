//! デバッグ対象メモリの読み取り

use crate::Result;

/// デバッグ対象のメモリを読み取るトレイト
///
/// ロケーション式の評価やスタックの巻き戻しで使う。
pub trait MemoryReader {
    /// 指定アドレスから `size` バイト読み取る
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// u64値を読み取る（リトルエンディアン）
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Failed to convert {} bytes to u64 array (expected 8 bytes)",
                bytes.len()
            )
        })?;
        Ok(u64::from_le_bytes(array))
    }
}
