//! 错误类型定义

use std::path::PathBuf;
use thiserror::Error;

/// 监视引擎错误
#[derive(Debug, Error)]
pub enum WatchError {
    /// 监视根路径不是目录
    #[error("路径不是目录: {0:?}")]
    NotADirectory(PathBuf),

    /// 单文件监视的目标不是普通文件
    #[error("路径不是文件: {0:?}")]
    NotAFile(PathBuf),

    /// 枚举目录树时发生除「目录不存在」之外的 IO 错误
    #[error("无法访问路径 {path:?}: {source}")]
    CannotAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 注册监视会超过文件描述符预算
    #[error("文件描述符已达上限 (当前已注册 {current} 个): {path:?}")]
    FdLimitReached { current: usize, path: PathBuf },

    /// 底层通知源创建或注册失败
    #[error("通知源注册失败: {0}")]
    RegisterFailed(String),
}

/// 同步编排器错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 源路径不存在或不是目录
    #[error("源目录不存在: {0:?}")]
    SourceNotFound(PathBuf),

    /// 已有同步在运行
    #[error("同步已在运行")]
    AlreadyRunning,

    /// 没有正在运行的同步
    #[error("同步未在运行")]
    NotRunning,

    /// 初始差异计算失败
    #[error("差异计算失败: {0}")]
    DiffFailed(String),

    /// 内部监视引擎启动失败
    #[error("监视引擎启动失败: {0}")]
    WatcherFailed(#[from] WatchError),
}
