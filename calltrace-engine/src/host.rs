//! デバッグホストの能力境界
//!
//! エンジンはここで定義するトレイトだけを通してデバッグ対象を観察します。
//! ptraceベースの実装は `calltrace-core` に、テスト用のメモリ内実装は
//! `synthetic` モジュールにあります。

use crate::Result;

/// スレッドID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub i32);

/// ソース位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// ファイル名（ディレクトリを含まない）
    pub file: String,
    /// ディレクトリ
    pub directory: Option<String>,
    /// 行番号（1始まり）
    pub line: u32,
}

impl SourceLocation {
    /// 新しいソース位置を作成する
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            directory: None,
            line,
        }
    }

    /// ディレクトリを設定する
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// ディスク上のパスを組み立てる
    pub fn path(&self) -> std::path::PathBuf {
        match &self.directory {
            Some(dir) => std::path::Path::new(dir).join(&self.file),
            None => std::path::PathBuf::from(&self.file),
        }
    }
}

/// スタックフレーム情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// フレームのインデックス（0が最も内側）
    pub index: usize,
    /// 完全修飾された関数名
    pub function: Option<String>,
    /// ソース位置
    pub location: Option<SourceLocation>,
    /// プログラムカウンタ
    pub pc: u64,
}

/// 型付きの値ハンドル
///
/// デバッグホストが変数1つ分について提供する情報です。
/// どのメソッドも失敗しうるため、`None` は「わからない」を意味します。
pub trait ValueView {
    /// 変数名またはフィールド名
    fn name(&self) -> Option<String>;

    /// 宣言された型名
    fn type_name(&self) -> Option<String>;

    /// ホストが直接描画できるスカラー値
    fn scalar(&self) -> Option<String>;

    /// ホストが提供する要約文字列
    fn summary(&self) -> Option<String> {
        None
    }

    /// 値が読み取り可能かどうか
    fn is_available(&self) -> bool {
        true
    }

    /// 子要素（フィールドまたは配列要素）の数
    fn child_count(&self) -> usize;

    /// インデックスで子要素を取得する
    fn child_at(&self, index: usize) -> Option<Box<dyn ValueView + '_>>;

    /// 名前で子要素を取得する
    fn child_named(&self, name: &str) -> Option<Box<dyn ValueView + '_>> {
        (0..self.child_count())
            .filter_map(|i| self.child_at(i))
            .find(|child| child.name().as_deref() == Some(name))
    }

    /// 値の格納領域の先頭から `len` バイト読み取る
    fn read_bytes(&self, len: usize) -> Option<Vec<u8>>;

    /// 値を符号なし整数として読み取る
    fn as_u64(&self) -> Option<u64> {
        let bytes = self.read_bytes(8)?;
        let array: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(u64::from_le_bytes(array))
    }
}

/// デバッグ対象のメモリ読み取り
pub trait MemoryAccess {
    /// 指定アドレスから `len` バイト読み取る
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// 64ビット値を読み取る（リトルエンディアン）
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, 8)?;
        let array: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(crate::TraceError::MemoryRead { addr, len: 8 })?;
        Ok(u64::from_le_bytes(array))
    }
}

/// 停止したスレッドのコールスタック
pub trait ThreadStack {
    /// インデックスでフレームを取得する（0が現在のフレーム）
    fn frame(&self, index: usize) -> Option<FrameInfo>;

    /// フレームの引数変数を宣言順で取得する
    fn arguments(&self, index: usize) -> Vec<Box<dyn ValueView + '_>>;

    /// 関数入口時点の整数引数レジスタ（呼び出し規約の順）
    fn entry_registers(&self) -> Vec<u64> {
        Vec::new()
    }
}

/// デバッグ対象の停止理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// 実行中（停止していない）
    Running,
    /// プロセス終了
    Exited(i32),
    /// シグナルによる停止
    Signal(i32),
    /// 未処理の例外
    Exception(String),
    /// ブレークポイントで停止
    Breakpoint,
}

/// SIGABRTのシグナル番号
pub const SIGABRT: i32 = 6;

impl StopReason {
    /// 中断（abort）系のシグナルかどうか
    pub fn is_abort(&self) -> bool {
        matches!(self, StopReason::Signal(SIGABRT))
    }
}

/// 停止イベント
pub struct StopEvent<'a> {
    /// 停止理由
    pub reason: StopReason,
    /// 停止したスレッドのスタック（プロセスが生存している場合）
    pub stack: Option<&'a dyn ThreadStack>,
}

impl<'a> StopEvent<'a> {
    /// スタックを伴わない停止イベントを作成する
    pub fn new(reason: StopReason) -> Self {
        Self {
            reason,
            stack: None,
        }
    }

    /// スタックを設定する
    pub fn with_stack(mut self, stack: &'a dyn ThreadStack) -> Self {
        self.stack = Some(stack);
        self
    }
}
