//! 配置类型 - 监视与同步的纯值配置

use serde::{Deserialize, Serialize};

/// 监视模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatchMode {
    /// 仅监视根目录本身
    Shallow,
    /// 监视根目录及全部子目录
    Recursive,
}

/// 订阅的通知类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyClasses {
    /// 内容写入
    #[serde(default = "default_true")]
    pub write: bool,
    /// 文件增长
    #[serde(default = "default_true")]
    pub extend: bool,
    /// 删除
    #[serde(default = "default_true")]
    pub delete: bool,
    /// 重命名
    #[serde(default = "default_true")]
    pub rename: bool,
    /// 属性变化
    #[serde(default = "default_true")]
    pub attribute: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotifyClasses {
    fn default() -> Self {
        Self {
            write: true,
            extend: true,
            delete: true,
            rename: true,
            attribute: true,
        }
    }
}

/// 过滤配置
///
/// 排除规则按路径组件精确匹配：规则 ".git" 只排除名字恰好是
/// ".git" 的条目，不做子串或通配匹配。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    /// 排除规则（逐路径组件精确比较）
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// 是否包含隐藏文件（以 "." 开头的条目）
    #[serde(default)]
    pub include_hidden: bool,
}

fn default_exclude_patterns() -> Vec<String> {
    vec![
        // 常见的排除目录
        ".git".to_string(),
        ".svn".to_string(),
        "node_modules".to_string(),
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
    ]
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
            include_hidden: false,
        }
    }
}

impl FilterConfig {
    /// 无任何排除规则、包含隐藏文件的过滤配置
    pub fn permissive() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            include_hidden: true,
        }
    }

    /// 单个名字是否命中排除规则
    pub fn matches_component(&self, name: &str) -> bool {
        self.exclude_patterns.iter().any(|p| p == name)
    }

    /// 相对路径（'/' 分隔）的任一组件是否命中排除规则
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        relative_path
            .split('/')
            .any(|component| self.matches_component(component))
    }

    /// 名字是否按隐藏规则被跳过
    pub fn is_hidden_filtered(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }
}

/// 监视引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// 监视模式
    #[serde(default = "default_mode")]
    pub mode: WatchMode,
    /// 订阅的通知类别
    #[serde(default)]
    pub classes: NotifyClasses,
    /// 事件通道容量
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_mode() -> WatchMode {
    WatchMode::Recursive
}

fn default_event_buffer() -> usize {
    1024
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            classes: NotifyClasses::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// 同步编排器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 启动时是否先计算并发出一次完整差异
    #[serde(default = "default_true")]
    pub compute_initial_diff: bool,
    /// 过滤配置（作用于初始差异与增量事件）
    #[serde(default)]
    pub filter: FilterConfig,
    /// 内部监视引擎配置
    #[serde(default)]
    pub watch: WatchConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            compute_initial_diff: true,
            filter: FilterConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}
