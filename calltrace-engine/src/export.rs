//! トレース文書の出力

use crate::correlator::blamed_index;
use crate::record::{CallId, CallRecord, ExecutionStatus, NO_PARENT};
use crate::{Result, TraceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// トレース全体の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Success,
    Error,
}

/// 引数1つ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgEntry {
    pub name: String,
    pub value: String,
}

/// 呼び出し1回分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEntry {
    pub call_id: CallId,
    pub parent_call_id: CallId,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub args: Vec<ArgEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// トレース文書
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceDocument {
    pub status: TraceStatus,
    pub calls: Vec<CallEntry>,
}

impl TraceDocument {
    /// 記録と実行状態から文書を組み立てる
    ///
    /// エラーの場合、原因と判定した呼び出しにだけ `error` を付ける。
    pub fn build(records: &[CallRecord], status: &ExecutionStatus) -> Self {
        let blamed = blamed_index(records, status);
        let calls = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let is_blamed = blamed == Some(index);
                CallEntry {
                    call_id: record.call_id,
                    parent_call_id: record.parent_call_id,
                    function: record.function.clone(),
                    file: record.file().to_string(),
                    line: record.line(),
                    args: record
                        .args
                        .iter()
                        .map(|a| ArgEntry {
                            name: a.name.clone(),
                            value: a.value.clone(),
                        })
                        .collect(),
                    error: is_blamed.then_some(true),
                    error_message: if is_blamed {
                        status.error_message.clone()
                    } else {
                        None
                    },
                }
            })
            .collect();

        Self {
            status: if status.is_error {
                TraceStatus::Error
            } else {
                TraceStatus::Success
            },
            calls,
        }
    }

    /// JSON文字列に変換する
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列から読み込む
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// ファイルに書き出す
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| TraceError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// ファイルから読み込む
    pub fn read_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// エラーが付いた呼び出し
    pub fn failing_call(&self) -> Option<&CallEntry> {
        self.calls.iter().find(|c| c.error == Some(true))
    }
}

/// 文書を呼び出しツリーのテキストにする
///
/// 親が0の呼び出しを根とし、親が見つからない呼び出しも根として扱う。
pub fn render_tree(document: &TraceDocument) -> String {
    let known: std::collections::HashSet<CallId> =
        document.calls.iter().map(|c| c.call_id).collect();
    let mut children: BTreeMap<CallId, Vec<&CallEntry>> = BTreeMap::new();
    for call in &document.calls {
        let parent = if known.contains(&call.parent_call_id) {
            call.parent_call_id
        } else {
            NO_PARENT
        };
        children.entry(parent).or_default().push(call);
    }

    let mut out = String::new();
    let status = match document.status {
        TraceStatus::Success => "success",
        TraceStatus::Error => "error",
    };
    let _ = writeln!(out, "status: {} ({} calls)", status, document.calls.len());

    let roots = children.get(&NO_PARENT).cloned().unwrap_or_default();
    for (i, root) in roots.iter().enumerate() {
        render_call(&mut out, root, &children, "", i + 1 == roots.len());
    }
    out
}

fn render_call(
    out: &mut String,
    call: &CallEntry,
    children: &BTreeMap<CallId, Vec<&CallEntry>>,
    prefix: &str,
    last: bool,
) {
    let branch = if last { "└── " } else { "├── " };
    let marker = if call.error == Some(true) { " [ERROR]" } else { "" };
    let _ = writeln!(
        out,
        "{}{}#{} {} ({}:{}){}",
        prefix, branch, call.call_id, call.function, call.file, call.line, marker
    );

    let inner = format!("{}{}", prefix, if last { "    " } else { "│   " });
    for arg in &call.args {
        let _ = writeln!(out, "{}  {} = {}", inner, arg.name, arg.value);
    }
    if let Some(message) = &call.error_message {
        let _ = writeln!(out, "{}  error: {}", inner, message);
    }

    let kids = children.get(&call.call_id).map(Vec::as_slice).unwrap_or(&[]);
    for (i, child) in kids.iter().enumerate() {
        render_call(out, child, children, &inner, i + 1 == kids.len());
    }
}
