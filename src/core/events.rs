//! 变更事件类型
//!
//! 底层通知源只给出「路径 + 原始标志」，监视引擎把它翻译成携带
//! 相对路径和条目类型的 ChangeEvent。

use crate::config::NotifyClasses;
use futures::Stream;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// 变更事件流
///
/// 有序；stop 完成或监视根被删除后终止，不再有后续元素。
pub type ChangeEventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// 原始通知标志
///
/// 对应底层通知源能够报告的五种变化。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyFlags {
    pub write: bool,
    pub extend: bool,
    pub delete: bool,
    pub rename: bool,
    pub attribute: bool,
}

impl NotifyFlags {
    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn extend() -> Self {
        Self {
            extend: true,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    pub fn rename() -> Self {
        Self {
            rename: true,
            ..Self::default()
        }
    }

    pub fn attribute() -> Self {
        Self {
            attribute: true,
            ..Self::default()
        }
    }

    /// 是否携带任何标志
    pub fn any(&self) -> bool {
        self.write || self.extend || self.delete || self.rename || self.attribute
    }

    /// 合并另一组标志
    pub fn merge(&mut self, other: NotifyFlags) {
        self.write |= other.write;
        self.extend |= other.extend;
        self.delete |= other.delete;
        self.rename |= other.rename;
        self.attribute |= other.attribute;
    }

    /// 按订阅类别过滤，未订阅的标志被清掉
    pub fn intersect(&self, classes: &NotifyClasses) -> NotifyFlags {
        NotifyFlags {
            write: self.write && classes.write,
            extend: self.extend && classes.extend,
            delete: self.delete && classes.delete,
            rename: self.rename && classes.rename,
            attribute: self.attribute && classes.attribute,
        }
    }
}

/// 原始通知（归一化到某个已注册路径）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNotification {
    pub path: PathBuf,
    pub flags: NotifyFlags,
}

/// 变更种类集合
///
/// 一次通知可以同时携带多种变化（例如 rename + attribute）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeKinds {
    pub created: bool,
    pub modified: bool,
    pub deleted: bool,
    pub renamed: bool,
    pub attributes_changed: bool,
}

impl ChangeKinds {
    pub fn created() -> Self {
        Self {
            created: true,
            ..Self::default()
        }
    }

    pub fn deleted() -> Self {
        Self {
            deleted: true,
            ..Self::default()
        }
    }

    /// 是否携带任何变更
    pub fn any(&self) -> bool {
        self.created || self.modified || self.deleted || self.renamed || self.attributes_changed
    }
}

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemType {
    File,
    Directory,
    Symlink,
    /// 无法确定（通常是条目已经消失，stat 失败）
    Unknown,
}

impl ItemType {
    /// 对路径做 stat 判定条目类型，失败时退化为 Unknown
    pub fn stat(path: &Path) -> ItemType {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => {
                let ft = meta.file_type();
                if ft.is_symlink() {
                    ItemType::Symlink
                } else if ft.is_dir() {
                    ItemType::Directory
                } else if ft.is_file() {
                    ItemType::File
                } else {
                    ItemType::Unknown
                }
            }
            Err(_) => ItemType::Unknown,
        }
    }
}

/// 变更事件
///
/// 不可变的值类型，每条通知产生一个，交付后即丢弃。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// 绝对路径
    pub absolute_path: PathBuf,
    /// 相对监视根的路径，'/' 分隔，根本身为空字符串，无前导斜杠
    pub relative_path: String,
    /// 监视根
    pub root: PathBuf,
    /// 变更种类
    pub kinds: ChangeKinds,
    /// 条目类型
    pub item_type: ItemType,
    /// 触发本事件的原始通知；合成事件（来自目录快照比对）为 None
    pub raw: Option<RawNotification>,
    /// 检测时间（Unix 时间戳，秒）
    pub detected_at: i64,
}

impl ChangeEvent {
    /// 事件是否针对监视根本身
    pub fn is_root(&self) -> bool {
        self.relative_path.is_empty()
    }
}

/// 计算相对监视根的路径（'/' 分隔，根为空字符串）
///
/// 路径不在根之下时返回 None。
pub fn relative_to_root(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = rel.to_string_lossy().replace('\\', "/");
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to_root() {
        let root = Path::new("/data/src");

        assert_eq!(relative_to_root(root, Path::new("/data/src")), Some(String::new()));
        assert_eq!(
            relative_to_root(root, Path::new("/data/src/a/b.txt")),
            Some("a/b.txt".to_string())
        );
        assert_eq!(relative_to_root(root, Path::new("/data/other")), None);
    }

    #[test]
    fn test_flags_intersect() {
        let mut classes = NotifyClasses::default();
        classes.attribute = false;

        let mut flags = NotifyFlags::write();
        flags.merge(NotifyFlags::attribute());

        let filtered = flags.intersect(&classes);
        assert!(filtered.write);
        assert!(!filtered.attribute);
    }
}
