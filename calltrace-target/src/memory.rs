//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::Path;

/// `/proc/<pid>/maps` の1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    /// `r-xp` 形式のパーミッション
    pub perms: String,
    /// ファイル内オフセット
    pub offset: u64,
    /// マップ元のパス（匿名マップなら空）
    pub pathname: String,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// ファイルから来たマップか
    pub fn is_file_backed(&self) -> bool {
        self.pathname.starts_with('/')
    }
}

/// mapsの1行を解析する
///
/// 形式: `address perms offset dev inode pathname`
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let perms = parts.next()?.to_string();
    let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    // パスに空白が含まれることがある
    let pathname = parts.collect::<Vec<_>>().join(" ");

    Some(MemoryMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        pathname,
    })
}

/// メモリアクセス
#[derive(Debug, Clone, Copy)]
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/mem が使えない場合は PTRACE_PEEKDATA にフォールバックする。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                tracing::trace!(
                    addr = format_args!("0x{:x}", addr),
                    error = %e,
                    "proc mem read failed, falling back to ptrace"
                );
                self.read_via_ptrace(addr, size)
            }
        }
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file =
            File::open(&mem_path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAでワード単位に読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let word_size = std::mem::size_of::<u64>();
        let mut data = Vec::with_capacity(size + word_size);

        for offset in (0..size).step_by(word_size) {
            let word_addr = addr.wrapping_add(offset as u64);
            let word = nix::sys::ptrace::read(self.pid, word_addr as *mut std::ffi::c_void)
                .map_err(|e| anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", word_addr, e))?;
            data.extend_from_slice(&word.to_ne_bytes());
        }

        data.truncate(size);
        Ok(data)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;
        file.write_all(data).map_err(|e| {
            anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e)
        })?;
        Ok(())
    }

    /// u64値を読み取る（リトルエンディアン）
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, 8)?;
        let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Failed to convert {} bytes to u64 array (expected 8 bytes)",
                bytes.len()
            )
        })?;
        Ok(u64::from_le_bytes(array))
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.read(addr, 1)?
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Cannot read u8 at 0x{:x}", addr))
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let text = std::fs::read_to_string(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        Ok(text.lines().filter_map(parse_maps_line).collect())
    }

    /// 実行可能ファイルがマップされた先頭アドレスを取得する
    ///
    /// ファイルオフセット0でマップされた最初の領域の開始アドレス。
    pub fn image_start(&self, path: &Path) -> Result<u64> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        image_start_in(&self.mappings()?, &canonical).ok_or_else(|| {
            anyhow::anyhow!("Could not find {} in memory mappings", canonical.display())
        })
    }
}

/// マップの一覧から、パスに一致するオフセット0の領域を探す
pub fn image_start_in(mappings: &[MemoryMapping], path: &Path) -> Option<u64> {
    mappings
        .iter()
        .find(|m| m.offset == 0 && Path::new(&m.pathname) == path)
        .map(|m| m.start)
}

impl calltrace_dwarf::MemoryReader for Memory {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        Memory::read(self, addr, size)
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        Memory::read_u64(self, addr)
    }
}

impl crate::breakpoint::CodePatch for Memory {
    fn read_byte(&self, addr: u64) -> Result<u8> {
        self.read_u8(addr)
    }

    fn write_byte(&self, addr: u64, value: u8) -> Result<()> {
        self.write_u8(addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltrace_dwarf::MemoryReader;

    const MAPS: &str = "\
55d0c8a00000-55d0c8a05000 r--p 00000000 08:01 1234 /work/app/target/debug/traced_app
55d0c8a05000-55d0c8a40000 r-xp 00005000 08:01 1234 /work/app/target/debug/traced_app
7f1234567000-7f1234568000 rw-p 00000000 00:00 0
7ffd1e2a0000-7ffd1e2c1000 rw-p 00000000 00:00 0 [stack]
7f12345a0000-7f12345b0000 r-xp 00000000 08:01 99 /opt/my libs/libfoo.so";

    #[test]
    fn test_parse_maps_line() {
        let mappings: Vec<_> = MAPS.lines().filter_map(parse_maps_line).collect();
        assert_eq!(mappings.len(), 5);

        let text = &mappings[1];
        assert_eq!(text.start, 0x55d0c8a05000);
        assert_eq!(text.offset, 0x5000);
        assert!(text.is_executable());
        assert!(text.contains(0x55d0c8a05010));
        assert!(text.is_file_backed());

        assert_eq!(mappings[2].pathname, "");
        assert!(!mappings[3].is_file_backed());
        assert_eq!(mappings[4].pathname, "/opt/my libs/libfoo.so");
        assert!(parse_maps_line("garbage").is_none());
    }

    #[test]
    fn test_image_start() {
        let mappings: Vec<_> = MAPS.lines().filter_map(parse_maps_line).collect();
        assert_eq!(
            image_start_in(&mappings, Path::new("/work/app/target/debug/traced_app")),
            Some(0x55d0c8a00000)
        );
        assert_eq!(image_start_in(&mappings, Path::new("/nonexistent")), None);
    }

    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = Memory::new(std::process::id() as i32);
        let addr = &value as *const u64 as u64;
        assert_eq!(MemoryReader::read_u64(&memory, addr).unwrap(), value);
        assert_eq!(memory.read_u8(addr).unwrap(), 0x88);
    }
}
