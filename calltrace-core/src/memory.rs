//! エンジン向けのメモリアクセス

use calltrace_dwarf::MemoryReader;
use calltrace_engine::{MemoryAccess, TraceError};

/// デバッグ対象のメモリをエンジンの `MemoryAccess` として見せる
pub struct HostMemory<'a> {
    reader: &'a dyn MemoryReader,
}

impl<'a> HostMemory<'a> {
    pub fn new(reader: &'a dyn MemoryReader) -> Self {
        Self { reader }
    }
}

impl MemoryAccess for HostMemory<'_> {
    fn read_memory(&self, addr: u64, len: usize) -> calltrace_engine::Result<Vec<u8>> {
        self.reader.read(addr, len).map_err(|e| {
            tracing::trace!(addr = format_args!("0x{:x}", addr), len, error = %e, "memory read failed");
            TraceError::MemoryRead { addr, len }
        })
    }
}
