//! スレッド管理機能

use crate::Result;
use std::collections::BTreeSet;

/// スレッドID（カーネルのtid）
pub type ThreadId = i32;

/// トレース中のスレッドの集合
#[derive(Debug, Clone, Default)]
pub struct ThreadSet {
    tids: BTreeSet<ThreadId>,
}

impl ThreadSet {
    /// 空の集合を作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// スレッドを追加する（新規なら true）
    pub fn insert(&mut self, tid: ThreadId) -> bool {
        self.tids.insert(tid)
    }

    /// スレッドを取り除く
    pub fn remove(&mut self, tid: ThreadId) -> bool {
        self.tids.remove(&tid)
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.tids.contains(&tid)
    }

    pub fn len(&self) -> usize {
        self.tids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    /// tid順に列挙する
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.tids.iter().copied()
    }
}

/// `/proc/<pid>/task` からプロセスのスレッドを列挙する
pub fn list_tasks(pid: i32) -> Result<Vec<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let entries = std::fs::read_dir(&task_dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?;

    let mut tids: Vec<ThreadId> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_set() {
        let mut set = ThreadSet::new();
        assert!(set.insert(20));
        assert!(set.insert(10));
        assert!(!set.insert(10));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![10, 20]);

        assert!(set.remove(20));
        assert!(!set.contains(20));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_list_own_tasks() {
        let pid = std::process::id() as i32;
        let tids = list_tasks(pid).unwrap();
        assert!(tids.contains(&pid));
    }
}
