//! ブレークポイント管理
//!
//! トレース用のブレークポイントはアドレスで管理します。
//! ヒットしたら対応するイベントをエンジンに渡し、自動的に実行を続けます。

use crate::Result;
use calltrace_target::{CodePatch, SoftwareBreakpoint};
use std::collections::BTreeMap;

/// ブレークポイントの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// トレース対象関数のエントリ
    Entry,
    /// パニック入口
    Panic,
}

/// ブレークポイント
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub address: u64,
    pub kind: BreakpointKind,
    /// 置いた関数の名前
    pub function: String,
    pub hits: u64,
}

/// ブレークポイントマネージャ
///
/// 論理的なブレークポイント情報とソフトウェアブレークポイント（INT3）を
/// 一緒に管理します。
pub struct BreakpointManager {
    breakpoints: BTreeMap<u64, (Breakpoint, SoftwareBreakpoint)>,
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            breakpoints: BTreeMap::new(),
        }
    }

    /// ブレークポイントを追加し、有効化する
    ///
    /// 同じアドレスに既にあれば何もせず `false` を返す。
    pub fn add_and_enable(
        &mut self,
        address: u64,
        kind: BreakpointKind,
        function: &str,
        code: &dyn CodePatch,
    ) -> Result<bool> {
        if self.breakpoints.contains_key(&address) {
            return Ok(false);
        }
        let mut sw_bp = SoftwareBreakpoint::new(address);
        sw_bp.enable(code)?;

        let bp = Breakpoint {
            address,
            kind,
            function: function.to_string(),
            hits: 0,
        };
        tracing::trace!(
            address = format_args!("0x{:x}", address),
            ?kind,
            function,
            "breakpoint inserted"
        );
        self.breakpoints.insert(address, (bp, sw_bp));
        Ok(true)
    }

    /// すべてのブレークポイントを無効化して削除する
    ///
    /// 元の命令に戻せなかったものがあっても残りは続けて処理し、最初のエラーを返す。
    pub fn remove_all(&mut self, code: &dyn CodePatch) -> Result<()> {
        let mut first_error = None;
        for (_, (_, mut sw_bp)) in std::mem::take(&mut self.breakpoints) {
            if let Err(e) = sw_bp.disable(code) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// プロセス終了後など、命令を戻さずに忘れる
    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }

    /// ヒットを記録してブレークポイントを返す
    pub fn hit(&mut self, address: u64) -> Option<&Breakpoint> {
        let (bp, _) = self.breakpoints.get_mut(&address)?;
        bp.hits += 1;
        Some(bp)
    }

    /// 一時的に元の命令に戻す（ステップオーバー用）
    pub fn suspend(&mut self, address: u64, code: &dyn CodePatch) -> Result<()> {
        if let Some((_, sw_bp)) = self.breakpoints.get_mut(&address) {
            sw_bp.disable(code)?;
        }
        Ok(())
    }

    /// `suspend` したブレークポイントを戻す
    pub fn resume(&mut self, address: u64, code: &dyn CodePatch) -> Result<()> {
        if let Some((_, sw_bp)) = self.breakpoints.get_mut(&address) {
            sw_bp.enable(code)?;
        }
        Ok(())
    }

    /// ブレークポイントを取得する
    pub fn get(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address).map(|(bp, _)| bp)
    }

    /// 全てのブレークポイントを取得する（アドレス順）
    pub fn all(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values().map(|(bp, _)| bp)
    }

    /// 種類ごとの数
    pub fn count_of(&self, kind: BreakpointKind) -> usize {
        self.all().filter(|bp| bp.kind == kind).count()
    }

    /// ブレークポイントの数を取得する
    pub fn count(&self) -> usize {
        self.breakpoints.len()
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}
