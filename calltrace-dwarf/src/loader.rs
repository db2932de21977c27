//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection, ObjectSegment};
use std::fs;
use std::path::{Path, PathBuf};

/// DWARFセクションを読むリーダー型
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARFローダー
///
/// ファイルの内容はプロセス終了まで保持する（`'static` の借用を配るため）。
pub struct DwarfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// ファイルの生データ
    data: &'static [u8],
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<DwarfReader>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data =
            fs::read(path).map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;
        let data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;
        let dwarf = load_dwarf_sections(&object_file)?;

        tracing::debug!(
            path = %path.display(),
            pie = matches!(object_file.kind(), object::ObjectKind::Dynamic),
            "loaded debug info"
        );

        Ok(Self {
            path: path.to_path_buf(),
            data,
            object_file,
            dwarf,
        })
    }

    /// ファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイルの生データ
    pub fn data(&self) -> &'static [u8] {
        self.data
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// 新しいDWARFコンテキストを作る（addr2lineなど所有権が必要な場合）
    pub fn load_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        load_dwarf_sections(&self.object_file)
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// エンディアン
    pub fn endian(&self) -> gimli::RunTimeEndian {
        endian_of(&self.object_file)
    }

    /// セクションのデータとファイル上のアドレスを取得する
    pub fn section(&self, name: &str) -> Option<(&'static [u8], u64)> {
        let section = self.object_file.section_by_name(name)?;
        let data = section.data().ok()?;
        Some((data, section.address()))
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// ET_DYN ならシンボルアドレスはロードベースからのオフセット。
    pub fn is_pie(&self) -> bool {
        matches!(self.object_file.kind(), object::ObjectKind::Dynamic)
    }

    /// ロード可能セグメントの最小仮想アドレス
    pub fn min_load_address(&self) -> u64 {
        self.object_file
            .segments()
            .map(|segment| segment.address())
            .min()
            .unwrap_or(0)
    }
}

fn endian_of(object_file: &object::File<'static>) -> gimli::RunTimeEndian {
    if object_file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    }
}

fn load_dwarf_sections(object_file: &object::File<'static>) -> Result<gimli::Dwarf<DwarfReader>> {
    let endian = endian_of(object_file);
    let load_section = |id: gimli::SectionId| -> Result<DwarfReader> {
        let data = object_file
            .section_by_name(id.name())
            .and_then(|section| section.data().ok())
            .unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(data, endian))
    };
    gimli::Dwarf::load(load_section)
        .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}
