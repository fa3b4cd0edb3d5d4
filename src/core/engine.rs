//! 同步编排器
//!
//! 把递归监视引擎和树差异计算拼成一条生命周期事件流：启动时可先发
//! 一次完整差异，之后把源树上的每个变更事件翻译成同步操作。操作
//! 只产出不执行，执行方按到达顺序应用即可。
//!
//! 状态机：idle -> running -> idle，可重入（停止后可以再次启动，
//! 每次启动产生新的事件流和新的内部监视引擎）。

use crate::config::{FilterConfig, SyncConfig};
use crate::core::comparator::{diff_trees, summarize_operations, SyncOperation};
use crate::core::events::{ChangeEvent, ChangeEventStream, ItemType};
use crate::core::watcher::RecursiveWatchEngine;
use crate::error::SyncError;
use futures::Stream;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 生命周期事件流，stop 完成后终止
pub type SyncEventStream = Pin<Box<dyn Stream<Item = SyncLifecycleEvent> + Send>>;

/// 同步生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SyncLifecycleEvent {
    /// 会话已启动
    Started,
    /// 启动时计算的完整差异
    InitialDiff(Vec<SyncOperation>),
    /// 一条增量操作
    Operation(SyncOperation),
    /// 会话已停止，流随之终止
    Stopped,
}

/// 一次运行期的内部资源
struct RunningInner {
    watcher: Arc<RecursiveWatchEngine>,
    cancel: CancellationToken,
}

/// 同步编排器
pub struct SyncOrchestrator {
    session_id: String,
    source_root: PathBuf,
    dest_root: PathBuf,
    config: SyncConfig,
    running: Arc<AtomicBool>,
    inner: Mutex<Option<RunningInner>>,
}

impl SyncOrchestrator {
    /// 创建编排器
    ///
    /// 源路径此刻必须是已存在的目录，否则直接失败。
    pub fn new(
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let source_root = source_root.into();
        if !source_root.is_dir() {
            return Err(SyncError::SourceNotFound(source_root));
        }

        Ok(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            source_root,
            dest_root: dest_root.into(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(None),
        })
    }

    /// 会话标识（用于日志关联）
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// 是否在运行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 启动同步会话，返回生命周期事件流
    ///
    /// 发出 Started；按配置计算并发出一次 InitialDiff；然后在源树上
    /// 启动监视引擎，持续把变更事件翻译成 Operation。已在运行时报
    /// AlreadyRunning，不产生任何状态变化。
    pub async fn start(&self) -> Result<SyncEventStream, SyncError> {
        let mut inner = self.inner.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }

        info!(
            "同步会话启动: {} ({:?} -> {:?})",
            self.session_id, self.source_root, self.dest_root
        );

        let (tx, rx) = mpsc::channel(self.config.watch.event_buffer.max(8));
        let _ = tx.send(SyncLifecycleEvent::Started).await;

        if self.config.compute_initial_diff {
            // 差异计算是同步纯函数，放到阻塞线程上跑
            let source = self.source_root.clone();
            let dest = self.dest_root.clone();
            let filter = self.config.filter.clone();
            let ops = tokio::task::spawn_blocking(move || diff_trees(&source, &dest, &filter))
                .await
                .map_err(|e| SyncError::DiffFailed(e.to_string()))?
                .map_err(|e| SyncError::DiffFailed(e.to_string()))?;

            let summary = summarize_operations(&ops);
            debug!(
                "初始差异: {} 个操作 (复制 {}, 覆盖 {}, 建目录 {}, 删除 {})",
                summary.total(),
                summary.copy_count,
                summary.update_count,
                summary.create_dir_count,
                summary.delete_file_count + summary.delete_dir_count
            );
            let _ = tx.send(SyncLifecycleEvent::InitialDiff(ops)).await;
        }

        // 监视引擎：先取事件流再启动，一条事件都不漏
        let watcher = Arc::new(
            RecursiveWatchEngine::new(&self.source_root, self.config.watch.clone())
                .map_err(SyncError::WatcherFailed)?,
        );
        let Some(events) = watcher.event_stream() else {
            return Err(SyncError::WatcherFailed(
                crate::error::WatchError::RegisterFailed("事件流不可用".to_string()),
            ));
        };
        watcher.start().await.map_err(SyncError::WatcherFailed)?;

        // 消费任务是生命周期通道唯一的长期持有方：Stopped 由它在退出
        // 前发出，恰好一次，随后通道关闭、流终止
        let cancel = CancellationToken::new();
        tokio::spawn(consume_changes(ConsumeCtx {
            dest_root: self.dest_root.clone(),
            filter: self.config.filter.clone(),
            lifecycle_tx: tx,
            cancel: cancel.clone(),
            running: self.running.clone(),
            session_id: self.session_id.clone(),
            events,
        }));

        *inner = Some(RunningInner { watcher, cancel });
        self.running.store(true, Ordering::SeqCst);

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// 停止同步会话
    ///
    /// 运行标志立即翻转；消费循环被取消后自行发出 Stopped 并终止
    /// 事件流。未在运行时报 NotRunning。
    pub async fn stop(&self) -> Result<(), SyncError> {
        let mut inner_guard = self.inner.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Err(SyncError::NotRunning);
        }
        let Some(inner) = inner_guard.take() else {
            return Err(SyncError::NotRunning);
        };
        self.running.store(false, Ordering::SeqCst);

        inner.cancel.cancel();
        inner.watcher.stop().await;

        info!("同步会话停止: {}", self.session_id);
        Ok(())
    }
}

/// 消费循环的上下文
struct ConsumeCtx {
    dest_root: PathBuf,
    filter: FilterConfig,
    lifecycle_tx: mpsc::Sender<SyncLifecycleEvent>,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    session_id: String,
    events: ChangeEventStream,
}

/// 持续消费变更事件并翻译成操作
///
/// 退出前发出 Stopped 并丢弃发送端，生命周期流随之终止。
async fn consume_changes(mut ctx: ConsumeCtx) {
    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            e = ctx.events.next() => match e {
                Some(e) => e,
                None => {
                    // 监视引擎自行终止（典型场景：源根目录被删除）
                    if !ctx.cancel.is_cancelled() {
                        warn!("变更事件流终止，同步会话结束: {}", ctx.session_id);
                    }
                    break;
                }
            },
        };

        if let Some(op) = translate_change(&event, &ctx.dest_root, &ctx.filter) {
            debug!("增量操作: {:?}", op);
            let _ = ctx.lifecycle_tx.send(SyncLifecycleEvent::Operation(op)).await;
        }
    }

    ctx.running.store(false, Ordering::SeqCst);
    let _ = ctx.lifecycle_tx.send(SyncLifecycleEvent::Stopped).await;
    debug!("消费循环退出: {}", ctx.session_id);
}

/// 把一个变更事件翻译成同步操作
///
/// 命中排除规则的事件整个丢弃。改名通知不带新旧名对应，在翻译时
/// 现场重查源路径：还存在按创建/复制处理（通知落在新名上），不存在
/// 按删除处理（通知落在旧名上）。目录不会产生 modified 事件，所以
/// modified 只映射文件覆盖。纯属性变化不产生操作。
pub fn translate_change(
    event: &ChangeEvent,
    dest_root: &Path,
    filter: &FilterConfig,
) -> Option<SyncOperation> {
    if !event.relative_path.is_empty() && filter.is_excluded(&event.relative_path) {
        return None;
    }

    let dest = dest_root.join(&event.relative_path);
    let source = event.absolute_path.clone();

    if event.kinds.deleted {
        return Some(match event.item_type {
            ItemType::Directory => SyncOperation::DeleteDirectory { dest },
            _ => SyncOperation::DeleteFile { dest },
        });
    }

    if event.kinds.created {
        return Some(match event.item_type {
            ItemType::Directory => SyncOperation::CreateDirectory { dest },
            _ => SyncOperation::CopyFile { source, dest },
        });
    }

    if event.kinds.renamed {
        // 现场重查：事件里的类型可能已经过时
        return Some(match ItemType::stat(&event.absolute_path) {
            ItemType::Directory => SyncOperation::CreateDirectory { dest },
            ItemType::File | ItemType::Symlink => SyncOperation::CopyFile { source, dest },
            ItemType::Unknown => SyncOperation::DeleteFile { dest },
        });
    }

    if event.kinds.modified && event.item_type != ItemType::Directory {
        return Some(SyncOperation::UpdateFile { source, dest });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::core::events::ChangeKinds;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn event(
        root: &Path,
        rel: &str,
        kinds: ChangeKinds,
        item_type: ItemType,
    ) -> ChangeEvent {
        ChangeEvent {
            absolute_path: root.join(rel),
            relative_path: rel.to_string(),
            root: root.to_path_buf(),
            kinds,
            item_type,
            raw: None,
            detected_at: 0,
        }
    }

    async fn next_lifecycle(stream: &mut SyncEventStream) -> Option<SyncLifecycleEvent> {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("等待生命周期事件超时")
    }

    #[test]
    fn test_translate_created_by_item_type() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dest_root = Path::new("/mirror");
        let filter = FilterConfig::permissive();

        let op = translate_change(
            &event(root, "sub", ChangeKinds::created(), ItemType::Directory),
            dest_root,
            &filter,
        );
        assert_eq!(
            op,
            Some(SyncOperation::CreateDirectory {
                dest: dest_root.join("sub")
            })
        );

        let op = translate_change(
            &event(root, "a.txt", ChangeKinds::created(), ItemType::File),
            dest_root,
            &filter,
        );
        assert_eq!(
            op,
            Some(SyncOperation::CopyFile {
                source: root.join("a.txt"),
                dest: dest_root.join("a.txt")
            })
        );
    }

    #[test]
    fn test_translate_deleted_by_item_type() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dest_root = Path::new("/mirror");
        let filter = FilterConfig::permissive();

        let op = translate_change(
            &event(root, "gone", ChangeKinds::deleted(), ItemType::Directory),
            dest_root,
            &filter,
        );
        assert_eq!(
            op,
            Some(SyncOperation::DeleteDirectory {
                dest: dest_root.join("gone")
            })
        );

        // 合成的删除事件类型不可判定，按文件删除处理
        let op = translate_change(
            &event(root, "gone.txt", ChangeKinds::deleted(), ItemType::Unknown),
            dest_root,
            &filter,
        );
        assert_eq!(
            op,
            Some(SyncOperation::DeleteFile {
                dest: dest_root.join("gone.txt")
            })
        );
    }

    #[test]
    fn test_translate_modified_file_only() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let filter = FilterConfig::permissive();

        let mut kinds = ChangeKinds::default();
        kinds.modified = true;

        let op = translate_change(
            &event(root, "f.txt", kinds, ItemType::File),
            Path::new("/mirror"),
            &filter,
        );
        assert!(matches!(op, Some(SyncOperation::UpdateFile { .. })));

        // 纯属性变化不翻译
        let mut kinds = ChangeKinds::default();
        kinds.attributes_changed = true;
        assert_eq!(
            translate_change(
                &event(root, "f.txt", kinds, ItemType::File),
                Path::new("/mirror"),
                &filter
            ),
            None
        );
    }

    #[test]
    fn test_translate_renamed_rechecks_source() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let filter = FilterConfig::permissive();
        let dest_root = Path::new("/mirror");

        let mut kinds = ChangeKinds::default();
        kinds.renamed = true;

        // 通知落在新名上：路径还在，按复制处理
        fs::write(root.join("new_name.txt"), "x").unwrap();
        let op = translate_change(
            &event(root, "new_name.txt", kinds, ItemType::File),
            dest_root,
            &filter,
        );
        assert_eq!(
            op,
            Some(SyncOperation::CopyFile {
                source: root.join("new_name.txt"),
                dest: dest_root.join("new_name.txt")
            })
        );

        // 通知落在旧名上：路径已经不在，按删除处理
        let op = translate_change(
            &event(root, "old_name.txt", kinds, ItemType::File),
            dest_root,
            &filter,
        );
        assert_eq!(
            op,
            Some(SyncOperation::DeleteFile {
                dest: dest_root.join("old_name.txt")
            })
        );
    }

    #[test]
    fn test_translate_drops_excluded_paths() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let mut filter = FilterConfig::permissive();
        filter.exclude_patterns = vec![".git".to_string()];

        let op = translate_change(
            &event(root, ".git/index", ChangeKinds::created(), ItemType::File),
            Path::new("/mirror"),
            &filter,
        );
        assert_eq!(op, None);
    }

    #[test]
    fn test_lifecycle_event_serializes_with_type_tag() {
        let json = serde_json::to_value(&SyncLifecycleEvent::Started).unwrap();
        assert_eq!(json["type"], "started");

        let op = SyncOperation::DeleteFile {
            dest: PathBuf::from("/d/x"),
        };
        let json = serde_json::to_value(&SyncLifecycleEvent::Operation(op)).unwrap();
        assert_eq!(json["type"], "operation");
        assert_eq!(json["data"]["type"], "deleteFile");
    }

    #[tokio::test]
    async fn test_source_must_exist_at_construction() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("absent");

        match SyncOrchestrator::new(&missing, tmp.path().join("dst"), SyncConfig::default()) {
            Err(SyncError::SourceNotFound(p)) => assert_eq!(p, missing),
            other => panic!("预期 SourceNotFound，实际: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_started_diff_stopped() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/a.txt"), "x").unwrap();
        fs::create_dir_all(&dst).unwrap();

        let config = SyncConfig {
            compute_initial_diff: true,
            filter: FilterConfig::permissive(),
            watch: WatchConfig::default(),
        };
        let orch = SyncOrchestrator::new(&src, &dst, config).unwrap();
        let mut stream = orch.start().await.unwrap();
        assert!(orch.is_running());

        // 重复启动是类型化错误，状态不变
        assert!(matches!(orch.start().await, Err(SyncError::AlreadyRunning)));
        assert!(orch.is_running());

        assert_eq!(
            next_lifecycle(&mut stream).await,
            Some(SyncLifecycleEvent::Started)
        );

        match next_lifecycle(&mut stream).await {
            Some(SyncLifecycleEvent::InitialDiff(ops)) => {
                assert_eq!(
                    ops,
                    vec![
                        SyncOperation::CreateDirectory {
                            dest: dst.join("sub")
                        },
                        SyncOperation::CopyFile {
                            source: src.join("sub/a.txt"),
                            dest: dst.join("sub/a.txt")
                        },
                    ]
                );
            }
            other => panic!("预期 InitialDiff，实际: {:?}", other),
        }

        orch.stop().await.unwrap();
        assert!(!orch.is_running());
        assert_eq!(
            next_lifecycle(&mut stream).await,
            Some(SyncLifecycleEvent::Stopped)
        );
        assert_eq!(next_lifecycle(&mut stream).await, None);

        // 再停一次是类型化错误
        assert!(matches!(orch.stop().await, Err(SyncError::NotRunning)));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();

        let config = SyncConfig {
            compute_initial_diff: false,
            filter: FilterConfig::permissive(),
            watch: WatchConfig::default(),
        };
        let orch = SyncOrchestrator::new(&src, tmp.path().join("dst"), config).unwrap();

        let mut first = orch.start().await.unwrap();
        assert_eq!(
            next_lifecycle(&mut first).await,
            Some(SyncLifecycleEvent::Started)
        );
        orch.stop().await.unwrap();

        // 可重入：停止后允许再次启动，拿到全新的事件流
        let mut second = orch.start().await.unwrap();
        assert_eq!(
            next_lifecycle(&mut second).await,
            Some(SyncLifecycleEvent::Started)
        );
        orch.stop().await.unwrap();
    }
}
