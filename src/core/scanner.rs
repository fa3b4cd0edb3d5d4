//! 目录树枚举
//!
//! 同步、无共享状态的纯函数：从根目录向下走一遍，产出以相对路径为
//! 键的条目状态列表，供差异计算使用。

use crate::config::FilterConfig;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;

/// 单个条目的状态快照
///
/// 每次枚举现做现用，调用之间没有持久身份。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    /// 相对枚举根的路径，'/' 分隔
    pub relative_path: String,
    pub is_dir: bool,
    /// 修改时间（Unix 时间戳，秒），读不到时为 None
    pub modified_time: Option<i64>,
    /// 文件大小，目录为 None
    pub size: Option<u64>,
}

/// 枚举目录树，返回按相对路径排序的条目列表（目录也计入）
///
/// - 不跟随符号链接下降；
/// - 根路径先做规范化，避免别名路径造成伪差异；
/// - 隐藏条目按 `include_hidden` 过滤；
/// - 命中排除规则的目录整棵剪掉，不会被下降。
pub fn enumerate_tree(root: &Path, filter: &FilterConfig) -> Result<Vec<ItemState>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("无法访问枚举根: {}", root.display()))?;

    let mut items = Vec::new();

    let walker = WalkDir::new(&root).follow_links(false).into_iter();

    for entry in walker.filter_entry(|e| {
        // 根自身永远保留
        if e.depth() == 0 {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !filter.is_hidden_filtered(&name) && !filter.matches_component(&name)
    }) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                // 条目在枚举期间消失属于正常竞争，跳过即可
                if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) {
                    continue;
                }
                return Err(anyhow::Error::new(e).context("枚举目录树失败"));
            }
        };

        if entry.depth() == 0 {
            continue;
        }

        let relative_path = entry
            .path()
            .strip_prefix(&root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if relative_path.is_empty() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };

        let modified_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        let is_dir = metadata.is_dir();
        items.push(ItemState {
            relative_path,
            is_dir,
            modified_time,
            size: if is_dir { None } else { Some(metadata.len()) },
        });
    }

    items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    debug!("枚举完成: {} -> {} 个条目", root.display(), items.len());

    Ok(items)
}

/// 枚举并构建相对路径索引
///
/// 根不存在时返回空索引，交由上层决定是否视为错误。
pub fn enumerate_tree_map(root: &Path, filter: &FilterConfig) -> Result<HashMap<String, ItemState>> {
    if !root.exists() {
        return Ok(HashMap::new());
    }

    let items = enumerate_tree(root, filter)?;
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        // 一次枚举内相对路径唯一
        map.insert(item.relative_path.clone(), item);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_enumerate_includes_dirs_and_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join("a.txt"), "a");
        touch(&root.join("sub/b.txt"), "b");

        let items = enumerate_tree(root, &FilterConfig::permissive()).unwrap();
        let paths: Vec<_> = items.iter().map(|i| i.relative_path.as_str()).collect();

        assert_eq!(paths, vec!["a.txt", "sub", "sub/b.txt"]);
        assert!(items.iter().find(|i| i.relative_path == "sub").unwrap().is_dir);
        assert_eq!(
            items
                .iter()
                .find(|i| i.relative_path == "a.txt")
                .unwrap()
                .size,
            Some(1)
        );
    }

    #[test]
    fn test_excluded_directory_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join(".git/config"), "x");
        touch(&root.join("keep.txt"), "y");
        // 子串不命中：这个文件应该保留
        touch(&root.join("notes.git.txt"), "z");

        let mut filter = FilterConfig::permissive();
        filter.exclude_patterns = vec![".git".to_string()];

        let items = enumerate_tree(root, &filter).unwrap();
        let paths: Vec<_> = items.iter().map(|i| i.relative_path.as_str()).collect();

        assert_eq!(paths, vec!["keep.txt", "notes.git.txt"]);
    }

    #[test]
    fn test_hidden_entries_skipped_by_default() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(&root.join(".hidden"), "h");
        touch(&root.join("shown.txt"), "s");

        let filter = FilterConfig {
            exclude_patterns: Vec::new(),
            include_hidden: false,
        };
        let items = enumerate_tree(root, &filter).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].relative_path, "shown.txt");
    }

    #[test]
    fn test_missing_root_gives_empty_map() {
        let tmp = TempDir::new().unwrap();
        let map =
            enumerate_tree_map(&tmp.path().join("absent"), &FilterConfig::permissive()).unwrap();
        assert!(map.is_empty());
    }
}
