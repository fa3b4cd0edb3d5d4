//! 树差异计算
//!
//! 比较源树和目标树，产出一串按固定顺序排列的同步操作。操作本身
//! 不在这里执行，所有权移交给调用方。
//!
//! 顺序是硬性契约：先删除（深的在前），再建目录（浅的在前），最后
//! 复制/更新文件。按序执行的一方永远不需要为复制补建父目录，也不会
//! 在目录还有内容时删目录。

use crate::config::FilterConfig;
use crate::core::scanner::{enumerate_tree, enumerate_tree_map, ItemState};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 同步操作
///
/// 重命名没有独立表示：底层通知原语给不出旧名到新名的对应关系，
/// 任何重命名都表现为一次普通删除加一次普通创建/复制。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncOperation {
    /// 复制文件：源路径 -> 目标路径
    CopyFile { source: PathBuf, dest: PathBuf },
    /// 覆盖已存在的目标文件
    UpdateFile { source: PathBuf, dest: PathBuf },
    /// 创建目标目录
    CreateDirectory { dest: PathBuf },
    /// 删除目标文件
    DeleteFile { dest: PathBuf },
    /// 删除目标目录（此时其内容必已先被删除）
    DeleteDirectory { dest: PathBuf },
}

impl SyncOperation {
    /// 操作作用的目标路径
    pub fn dest(&self) -> &Path {
        match self {
            SyncOperation::CopyFile { dest, .. }
            | SyncOperation::UpdateFile { dest, .. }
            | SyncOperation::CreateDirectory { dest }
            | SyncOperation::DeleteFile { dest }
            | SyncOperation::DeleteDirectory { dest } => dest,
        }
    }
}

/// 操作统计
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub copy_count: usize,
    pub update_count: usize,
    pub create_dir_count: usize,
    pub delete_file_count: usize,
    pub delete_dir_count: usize,
}

impl OperationSummary {
    pub fn total(&self) -> usize {
        self.copy_count
            + self.update_count
            + self.create_dir_count
            + self.delete_file_count
            + self.delete_dir_count
    }
}

/// 统计一串操作
pub fn summarize_operations(operations: &[SyncOperation]) -> OperationSummary {
    let mut summary = OperationSummary::default();

    for op in operations {
        match op {
            SyncOperation::CopyFile { .. } => summary.copy_count += 1,
            SyncOperation::UpdateFile { .. } => summary.update_count += 1,
            SyncOperation::CreateDirectory { .. } => summary.create_dir_count += 1,
            SyncOperation::DeleteFile { .. } => summary.delete_file_count += 1,
            SyncOperation::DeleteDirectory { .. } => summary.delete_dir_count += 1,
        }
    }

    summary
}

/// 枚举两棵树并计算有序操作列表
///
/// 源树必须存在；目标树不存在时按空树处理（全量复制）。
pub fn diff_trees(
    source_root: &Path,
    dest_root: &Path,
    filter: &FilterConfig,
) -> Result<Vec<SyncOperation>> {
    let source_items = enumerate_tree(source_root, filter)?;
    let mut source = HashMap::with_capacity(source_items.len());
    for item in source_items {
        source.insert(item.relative_path.clone(), item);
    }

    let dest = enumerate_tree_map(dest_root, filter)?;

    let operations = compute_operations(&source, &dest, source_root, dest_root);

    debug!(
        "差异计算完成: 源 {} 条目, 目标 {} 条目, {} 个操作",
        source.len(),
        dest.len(),
        operations.len()
    );

    Ok(operations)
}

/// 相对路径深度（路径分隔符个数）
fn depth(relative_path: &str) -> usize {
    relative_path.matches('/').count()
}

/// 由两份相对路径索引计算有序操作列表
///
/// 分三组拼接，组内各自排序，组间顺序固定：
/// 1. 删除：目标有而源没有的条目，深度降序（先删文件和深层目录，
///    保证删目录时它已经空了）；
/// 2. 建目录：源有而目标没有的目录，深度升序（先建父目录）；
/// 3. 文件同步：源端每个非目录条目，目标缺失则复制；两边都有时，
///    源修改时间严格更新或大小不同，任一条件成立即覆盖。
pub fn compute_operations(
    source: &HashMap<String, ItemState>,
    dest: &HashMap<String, ItemState>,
    source_root: &Path,
    dest_root: &Path,
) -> Vec<SyncOperation> {
    let mut operations = Vec::new();

    // 1. 删除：深的在前
    let mut to_delete: Vec<&ItemState> = dest
        .values()
        .filter(|item| !source.contains_key(&item.relative_path))
        .collect();
    to_delete.sort_by(|a, b| {
        depth(&b.relative_path)
            .cmp(&depth(&a.relative_path))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });

    for item in to_delete {
        let dest_path = dest_root.join(&item.relative_path);
        if item.is_dir {
            operations.push(SyncOperation::DeleteDirectory { dest: dest_path });
        } else {
            operations.push(SyncOperation::DeleteFile { dest: dest_path });
        }
    }

    // 2. 建目录：浅的在前
    let mut to_create: Vec<&ItemState> = source
        .values()
        .filter(|item| item.is_dir && !dest.contains_key(&item.relative_path))
        .collect();
    to_create.sort_by(|a, b| {
        depth(&a.relative_path)
            .cmp(&depth(&b.relative_path))
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });

    for item in to_create {
        operations.push(SyncOperation::CreateDirectory {
            dest: dest_root.join(&item.relative_path),
        });
    }

    // 3. 文件复制/更新
    let mut source_files: Vec<&ItemState> = source.values().filter(|item| !item.is_dir).collect();
    source_files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    for item in source_files {
        let source_path = source_root.join(&item.relative_path);
        let dest_path = dest_root.join(&item.relative_path);

        match dest.get(&item.relative_path) {
            None => operations.push(SyncOperation::CopyFile {
                source: source_path,
                dest: dest_path,
            }),
            Some(existing) => {
                if needs_update(item, existing) {
                    operations.push(SyncOperation::UpdateFile {
                        source: source_path,
                        dest: dest_path,
                    });
                }
            }
        }
    }

    operations
}

/// 源条目是否需要覆盖目标条目
///
/// 源修改时间严格更新，或大小不同，任一条件单独成立即可。
fn needs_update(source: &ItemState, dest: &ItemState) -> bool {
    let newer = match (source.modified_time, dest.modified_time) {
        (Some(s), Some(d)) => s > d,
        _ => false,
    };
    newer || source.size != dest.size
}
