//! ソース行情報

use crate::{DwarfLoader, DwarfReader, Result};
use std::path::Path;

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    /// ファイル名（ディレクトリを除いたもの）
    pub file: String,
    /// ディレクトリ
    pub directory: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl LineInfo {
    /// フルパスから作成する
    pub fn from_path(path: &str, line: u32, column: Option<u32>) -> Self {
        let path = Path::new(path);
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = path
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            file,
            directory,
            line,
            column,
        }
    }
}

/// ソース行情報の取得
///
/// addr2lineのコンテキストを保持する。アドレスはすべてファイル上のアドレス。
pub struct LineInfoProvider {
    context: addr2line::Context<DwarfReader>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let context = addr2line::Context::from_dwarf(loader.load_dwarf()?)
            .map_err(|e| anyhow::anyhow!("Failed to build line table context: {}", e))?;
        Ok(Self { context })
    }

    /// アドレスからソース行情報を取得する
    ///
    /// 行番号0（コンパイラ生成コード）は位置なしとみなす。
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| match (loc.file, loc.line) {
            (Some(file), Some(line)) if line > 0 => Some(LineInfo::from_path(file, line, loc.column)),
            _ => None,
        }))
    }

    /// 関数のプロローグ終了アドレスを推定する
    ///
    /// `[low, high)` の行テーブルで、先頭より後に始まる最初の行の先頭を返す。
    /// 見つからなければ `low`。
    pub fn prologue_end(&self, low: u64, high: u64) -> u64 {
        let ranges = match self.context.find_location_range(low, high) {
            Ok(ranges) => ranges,
            Err(e) => {
                tracing::trace!(low = format_args!("0x{:x}", low), error = %e, "no line ranges");
                return low;
            }
        };
        ranges
            .map(|(addr, _, _)| addr)
            .find(|addr| *addr > low && *addr < high)
            .unwrap_or(low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_info_from_path() {
        let info = LineInfo::from_path("/work/app/src/main.rs", 12, Some(5));
        assert_eq!(info.file, "main.rs");
        assert_eq!(info.directory, "/work/app/src");
        assert_eq!(info.line, 12);

        let bare = LineInfo::from_path("lib.rs", 1, None);
        assert_eq!(bare.file, "lib.rs");
        assert_eq!(bare.directory, "");
    }
}
