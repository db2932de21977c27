//! デバッグ対象のアドレス空間
//!
//! 実行可能ファイルと、実行中にマップされた共有ライブラリを `Image` として持ちます。
//! 各イメージのロードバイアスは `/proc/<pid>/maps` から求め、`.eh_frame` を
//! 巻き戻し器に登録します。共有ライブラリは巻き戻しで未知のアドレスに
//! 出会ったときに見つけて読み込みます。

use crate::Result;
use calltrace_dwarf::{
    DebugInfo, DwarfLoader, DwarfRegisters, FunctionEntry, LineInfoProvider, Symbol,
    SymbolResolver, UnwindFrame, Unwinder,
};
use calltrace_engine::SourceLocation;
use calltrace_target::memory::image_start_in;
use calltrace_target::{Memory, MemoryMapping};
use std::path::{Path, PathBuf};

/// 1つのELFイメージ
pub struct Image {
    path: PathBuf,
    loader: DwarfLoader,
    symbols: SymbolResolver,
    debug: Option<DebugInfo>,
    lines: Option<LineInfoProvider>,
    /// ロードバイアス（実行時アドレス - ファイル上のアドレス）
    bias: u64,
    /// 実行時にマップされている実行可能領域
    ranges: Vec<(u64, u64)>,
}

impl Image {
    /// ELFファイルを読み込む
    ///
    /// デバッグ情報がなくてもシンボルだけで読み込める。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let loader = DwarfLoader::load(&path)?;
        let symbols = SymbolResolver::new(&loader)?;

        let debug = match DebugInfo::new(&loader) {
            Ok(info) if !info.functions().is_empty() => Some(info),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no usable debug info");
                None
            }
        };
        let lines = match debug {
            Some(_) => LineInfoProvider::new(&loader)
                .map_err(|e| tracing::debug!(path = %path.display(), error = %e, "no line table"))
                .ok(),
            None => None,
        };

        Ok(Self {
            path,
            loader,
            symbols,
            debug,
            lines,
            bias: 0,
            ranges: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }

    /// デバッグ情報（持っていれば）
    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug.as_ref()
    }

    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// 実行時にマップ済みか
    pub fn is_mapped(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// 実行時アドレスがこのイメージのコードを指しているか
    pub fn contains(&self, pc: u64) -> bool {
        self.ranges.iter().any(|(start, end)| pc >= *start && pc < *end)
    }

    /// ファイル上のアドレスを実行時アドレスにする
    pub fn runtime_address(&self, file_addr: u64) -> u64 {
        file_addr.wrapping_add(self.bias)
    }

    /// 実行時アドレスをファイル上のアドレスにする
    pub fn file_address(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.bias)
    }

    /// 実行時アドレスを含む関数のデバッグ情報
    pub fn function_at(&self, pc: u64) -> Option<&FunctionEntry> {
        self.debug.as_ref()?.function_at(self.file_address(pc))
    }

    /// 実行時アドレスを含む関数の名前
    ///
    /// デバッグ情報を優先し、なければシンボルテーブルを使う。
    pub fn function_name(&self, pc: u64) -> Option<String> {
        if let Some(function) = self.function_at(pc) {
            return Some(function.name.clone());
        }
        self.symbols
            .reverse_resolve(self.file_address(pc))
            .map(|symbol| symbol.display_name().to_string())
    }

    /// 実行時アドレスのソース位置
    pub fn location(&self, pc: u64) -> Option<SourceLocation> {
        let lines = self.lines.as_ref()?;
        let info = match lines.lookup(self.file_address(pc)) {
            Ok(info) => info?,
            Err(e) => {
                tracing::trace!(pc = format_args!("0x{:x}", pc), error = %e, "line lookup failed");
                return None;
            }
        };
        let location = SourceLocation::new(info.file, info.line);
        Some(if info.directory.is_empty() {
            location
        } else {
            location.with_directory(info.directory)
        })
    }

    /// 関数シンボルのエントリブレークポイント位置（ファイル上のアドレス）
    ///
    /// 行テーブルがあればプロローグの直後、なければ関数の先頭。
    pub fn entry_address(&self, symbol: &Symbol) -> u64 {
        match &self.lines {
            Some(lines) => lines.prologue_end(symbol.address, symbol.address + symbol.size),
            None => symbol.address,
        }
    }
}

/// デバッグ対象のアドレス空間
pub struct AddressSpace {
    /// 先頭は実行可能ファイル
    images: Vec<Image>,
    unwinder: Unwinder,
    /// 調べ終えた実行可能領域
    scanned: Vec<(u64, u64)>,
}

impl AddressSpace {
    /// 実行可能ファイルからアドレス空間を作る（まだマップされていない）
    pub fn new(main: Image) -> Self {
        Self {
            images: vec![main],
            unwinder: Unwinder::new(),
            scanned: Vec::new(),
        }
    }

    /// 実行可能ファイル
    pub fn main(&self) -> &Image {
        &self.images[0]
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// 実行時アドレスを含むイメージ
    pub fn image_for(&self, pc: u64) -> Option<&Image> {
        self.images.iter().find(|image| image.contains(pc))
    }

    /// 実行時のマッピング情報を捨てる（別のプロセスに切り替えるとき）
    pub fn reset(&mut self) {
        self.images.truncate(1);
        self.images[0].bias = 0;
        self.images[0].ranges.clear();
        self.unwinder = Unwinder::new();
        self.scanned.clear();
    }

    fn was_scanned(&self, pc: u64) -> bool {
        self.scanned.iter().any(|(start, end)| pc >= *start && pc < *end)
    }

    /// マップの一覧から新しい実行可能領域を取り込む
    ///
    /// 新たに巻き戻し可能になった領域があれば `true`。
    pub fn refresh(&mut self, mappings: &[MemoryMapping]) -> bool {
        let mut added = false;
        for mapping in mappings.iter().filter(|m| m.is_executable()) {
            let range = (mapping.start, mapping.end);
            if self.scanned.contains(&range) {
                continue;
            }
            self.scanned.push(range);
            if !mapping.is_file_backed() {
                continue;
            }

            let path = Path::new(&mapping.pathname);
            let index = match self.images.iter().position(|image| image.path == path) {
                Some(index) => index,
                None => match Image::load(path) {
                    Ok(image) => {
                        self.images.push(image);
                        self.images.len() - 1
                    }
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "skipping mapping");
                        continue;
                    }
                },
            };

            let image = &mut self.images[index];
            let Some(start) = image_start_in(mappings, path) else {
                continue;
            };
            if image.loader.is_pie() {
                image.bias = start.wrapping_sub(image.loader.min_load_address());
            }
            image.ranges.push(range);
            if self.unwinder.add_image(&image.loader, image.bias, range) {
                added = true;
            }
            tracing::debug!(
                path = %path.display(),
                bias = format_args!("0x{:x}", image.bias),
                "mapped image"
            );
        }
        added
    }

    /// スタックを巻き戻す
    ///
    /// 未知のコード領域に出会ったら、マップを読み直してやり直す。
    pub fn unwind(
        &mut self,
        registers: &DwarfRegisters,
        memory: &Memory,
        max_frames: usize,
    ) -> Vec<UnwindFrame> {
        let frames = self.unwinder.unwind(registers, memory, max_frames);
        let unknown = frames
            .iter()
            .any(|frame| !self.unwinder.covers(frame.pc) && !self.was_scanned(frame.pc));
        if !unknown {
            return frames;
        }
        match memory.mappings() {
            Ok(mappings) if self.refresh(&mappings) => {
                self.unwinder.unwind(registers, memory, max_frames)
            }
            Ok(_) => frames,
            Err(e) => {
                tracing::debug!(error = %e, "could not read mappings");
                frames
            }
        }
    }
}
