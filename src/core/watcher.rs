//! 递归监视引擎
//!
//! 维护当前受监视目录的集合，把底层通知翻译成携带相对路径的变更
//! 事件。目录内容的增删靠子项快照比对发现：每个受监视目录保存一份
//! 已知子项名集合，收到该目录的写入通知时重新列目录、求差集，为新
//! 出现/消失的条目合成 created/deleted 事件。
//!
//! 全部可变状态集中在一个 WatchState 里，由单把互斥锁保护；文件系统
//! IO 都在锁外完成，锁内只做快照交换。事件按消费顺序投递给回调接收
//! 器和事件流，两者之间不重排、不攒批。

use crate::config::{NotifyClasses, WatchConfig, WatchMode};
use crate::core::events::{
    relative_to_root, ChangeEvent, ChangeEventStream, ChangeKinds, ItemType, RawNotification,
};
use crate::core::source::{ChangeEventSink, DirectoryNotifySource, NotificationSource};
use crate::error::WatchError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 文件描述符预算的安全余量
const FD_SAFETY_MARGIN: usize = 64;
/// 预算下限
const FD_BUDGET_FLOOR: usize = 256;

/// 一个受监视的目录
#[derive(Debug, Clone)]
pub struct WatchedDirectory {
    /// 绝对路径
    pub absolute_path: PathBuf,
    /// 相对监视根的路径，根本身为空字符串
    pub relative_path: String,
    /// 最近一次观察到的子项名集合
    pub known_children: HashSet<String>,
}

/// 引擎的全部可变状态，单锁保护
struct WatchState {
    watched: HashMap<PathBuf, WatchedDirectory>,
    active: bool,
    paused: bool,
}

/// 引擎 API 与消费任务共享的部分
struct EngineShared {
    root: PathBuf,
    mode: WatchMode,
    classes: NotifyClasses,
    fd_budget: usize,
    source: Arc<dyn NotificationSource>,
    state: Mutex<WatchState>,
    cancel: CancellationToken,
    callback: StdMutex<Option<Arc<dyn ChangeEventSink>>>,
    /// 事件流的发送端；停止时取走即终止流
    event_tx: StdMutex<Option<mpsc::Sender<ChangeEvent>>>,
    /// 事件流是否已被取走消费；没人消费就不往通道里投
    stream_taken: AtomicBool,
}

/// 递归监视引擎
///
/// 停止后不可重启：stop 会终止事件流，重新监视需要新建引擎。
pub struct RecursiveWatchEngine {
    shared: Arc<EngineShared>,
    raw_rx: StdMutex<Option<mpsc::Receiver<RawNotification>>>,
    event_rx: StdMutex<Option<mpsc::Receiver<ChangeEvent>>>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RecursiveWatchEngine {
    /// 用 notify 支撑的生产通知源创建引擎
    pub fn new(root: impl Into<PathBuf>, config: WatchConfig) -> Result<Self, WatchError> {
        let (source, raw_rx) = DirectoryNotifySource::new(config.event_buffer)?;
        Ok(Self::with_source(root, config, source, raw_rx))
    }

    /// 用外部注入的通知源创建引擎
    pub fn with_source(
        root: impl Into<PathBuf>,
        config: WatchConfig,
        source: Arc<dyn NotificationSource>,
        raw_rx: mpsc::Receiver<RawNotification>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);

        Self {
            shared: Arc::new(EngineShared {
                root: root.into(),
                mode: config.mode,
                classes: config.classes,
                fd_budget: fd_watch_budget(),
                source,
                state: Mutex::new(WatchState {
                    watched: HashMap::new(),
                    active: false,
                    paused: false,
                }),
                cancel: CancellationToken::new(),
                callback: StdMutex::new(None),
                event_tx: StdMutex::new(Some(event_tx)),
                stream_taken: AtomicBool::new(false),
            }),
            raw_rx: StdMutex::new(Some(raw_rx)),
            event_rx: StdMutex::new(Some(event_rx)),
            task: StdMutex::new(None),
        }
    }

    /// 设置回调接收器（与事件流并行投递），须在 start 之前调用
    pub fn set_event_sink(&self, sink: Arc<dyn ChangeEventSink>) {
        *self.shared.callback.lock().unwrap() = Some(sink);
    }

    /// 取走事件流，只能取一次
    pub fn event_stream(&self) -> Option<ChangeEventStream> {
        let rx = self.event_rx.lock().unwrap().take()?;
        self.shared.stream_taken.store(true, Ordering::Relaxed);
        Some(Box::pin(ReceiverStream::new(rx)))
    }

    /// 启动监视
    ///
    /// 注册根目录，递归模式下还注册不跨符号链接可达的全部子目录，
    /// 然后开始消费通知流。已在运行时是无副作用的空操作。失败时
    /// 撤销全部已注册路径。
    pub async fn start(&self) -> Result<(), WatchError> {
        // 根必须在调用时就是目录
        match std::fs::metadata(&self.shared.root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(WatchError::NotADirectory(self.shared.root.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WatchError::NotADirectory(self.shared.root.clone()));
            }
            Err(e) => {
                return Err(WatchError::CannotAccess {
                    path: self.shared.root.clone(),
                    source: e,
                });
            }
        }

        {
            let mut st = self.shared.state.lock().await;
            if st.active {
                return Ok(());
            }
            st.active = true;
        }

        let Some(raw_rx) = self.raw_rx.lock().unwrap().take() else {
            // stop 过的引擎不能再启动
            self.shared.state.lock().await.active = false;
            return Err(WatchError::RegisterFailed(
                "引擎已停止，需要重新创建".to_string(),
            ));
        };

        // 枚举并注册，文件系统遍历放到阻塞线程上；失败时把原始通道
        // 放回去，调用方修正条件后可以重试
        let shared = self.shared.clone();
        let table = match tokio::task::spawn_blocking(move || register_tree(&shared)).await {
            Ok(Ok(table)) => table,
            Ok(Err(e)) => {
                *self.raw_rx.lock().unwrap() = Some(raw_rx);
                self.shared.state.lock().await.active = false;
                return Err(e);
            }
            Err(e) => {
                *self.raw_rx.lock().unwrap() = Some(raw_rx);
                self.shared.state.lock().await.active = false;
                return Err(WatchError::RegisterFailed(format!("枚举任务失败: {}", e)));
            }
        };

        let count = table.len();
        {
            let mut st = self.shared.state.lock().await;
            st.watched = table;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(run_consumer(shared, raw_rx));
        *self.task.lock().unwrap() = Some(handle);

        info!(
            "开始监视: {:?} ({} 个目录, 预算 {})",
            self.shared.root, count, self.shared.fd_budget
        );

        Ok(())
    }

    /// 停止监视
    ///
    /// 活动标志立即翻转；消费任务的退出和路径注销异步完成。需要
    /// 「完全停止」语义的调用方应等待事件流结束。幂等。
    pub async fn stop(&self) {
        let paths: Vec<PathBuf> = {
            let mut st = self.shared.state.lock().await;
            st.active = false;
            st.paused = false;
            st.watched.drain().map(|(k, _)| k).collect()
        };

        for p in &paths {
            self.shared.source.unregister(p);
        }

        self.shared.cancel.cancel();
        self.shared.event_tx.lock().unwrap().take();
        // 没启动过也要把原始通道放掉，保证流终止
        self.raw_rx.lock().unwrap().take();

        if !paths.is_empty() {
            info!("停止监视: {:?} ({} 个目录)", self.shared.root, paths.len());
        }
    }

    /// 暂停投递
    ///
    /// 注册保持打开，不发生描述符抖动；暂停期间到达的事件被丢弃，
    /// 恢复后不补发。
    pub async fn pause(&self) {
        {
            let mut st = self.shared.state.lock().await;
            if !st.active || st.paused {
                return;
            }
            st.paused = true;
        }
        self.shared.source.pause_delivery();
        info!("暂停投递: {:?}", self.shared.root);
    }

    /// 恢复投递
    ///
    /// 恢复前先刷新全部子项快照：暂停期间发生的变化被静默吸收，
    /// 不会以迟到事件的形式出现。基线刷新完成之前暂停标志保持有效，
    /// 避免滞留的通知抢在刷新前被消费。
    pub async fn resume(&self) {
        let was_paused = {
            let st = self.shared.state.lock().await;
            st.active && st.paused
        };
        if !was_paused {
            return;
        }

        self.shared.rebaseline().await;

        {
            let mut st = self.shared.state.lock().await;
            st.paused = false;
        }
        self.shared.source.resume_delivery();
        info!("恢复投递: {:?}", self.shared.root);
    }

    /// 当前受监视目录数
    pub async fn watched_directory_count(&self) -> usize {
        self.shared.state.lock().await.watched.len()
    }

    /// 当前受监视路径列表
    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        let st = self.shared.state.lock().await;
        let mut paths: Vec<PathBuf> = st.watched.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// 是否在监视中
    pub async fn is_watching(&self) -> bool {
        self.shared.state.lock().await.active
    }

    /// 是否处于暂停
    pub async fn is_paused(&self) -> bool {
        self.shared.state.lock().await.paused
    }

    /// 监视根
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    #[cfg(test)]
    pub(crate) fn set_fd_budget_for_test(&mut self, budget: usize) {
        Arc::get_mut(&mut self.shared).unwrap().fd_budget = budget;
    }
}

/// 计算描述符预算：软限制减去安全余量，再做下限保护
fn fd_watch_budget() -> usize {
    #[cfg(unix)]
    {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let soft = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } == 0 {
            lim.rlim_cur as usize
        } else {
            1024
        };
        soft.saturating_sub(FD_SAFETY_MARGIN).max(FD_BUDGET_FLOOR)
    }
    #[cfg(not(unix))]
    {
        4096usize.saturating_sub(FD_SAFETY_MARGIN).max(FD_BUDGET_FLOOR)
    }
}

/// 列出目录的直接子项名
fn list_child_names(dir: &Path) -> std::io::Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// 拼接相对路径
fn join_rel(dir_rel: &str, name: &str) -> String {
    if dir_rel.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir_rel, name)
    }
}

/// 深度优先枚举并注册整棵树
///
/// 初始注册阶段超出预算是致命错误；任何失败都会撤销这次调用已经
/// 注册的全部路径。
fn register_tree(
    shared: &EngineShared,
) -> Result<HashMap<PathBuf, WatchedDirectory>, WatchError> {
    let mut table = HashMap::new();

    // 失败退出时撤销本次已注册的路径
    let mut rollback = scopeguard::guard(Vec::<PathBuf>::new(), {
        let source = shared.source.clone();
        move |paths| {
            for p in &paths {
                source.unregister(p);
            }
        }
    });

    let mut stack = vec![shared.root.clone()];
    while let Some(dir) = stack.pop() {
        if table.len() >= shared.fd_budget {
            return Err(WatchError::FdLimitReached {
                current: table.len(),
                path: dir,
            });
        }

        let children = match list_child_names(&dir) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // 目录在枚举期间消失，跳过
                continue;
            }
            Err(e) => {
                return Err(WatchError::CannotAccess {
                    path: dir,
                    source: e,
                });
            }
        };

        shared.source.register(&dir, shared.classes)?;
        rollback.push(dir.clone());

        let relative_path = relative_to_root(&shared.root, &dir).unwrap_or_default();
        table.insert(
            dir.clone(),
            WatchedDirectory {
                absolute_path: dir.clone(),
                relative_path,
                known_children: children.clone(),
            },
        );

        if shared.mode == WatchMode::Recursive {
            for name in &children {
                let child = dir.join(name);
                // 不跨符号链接下降
                if let Ok(meta) = std::fs::symlink_metadata(&child) {
                    if meta.file_type().is_dir() {
                        stack.push(child);
                    }
                }
            }
        }
    }

    // 成功：解除回滚
    scopeguard::ScopeGuard::into_inner(rollback);
    Ok(table)
}

/// 消费任务主循环
///
/// 这是稳态下逐事件派生状态的唯一写入方；只在等待下一条通知时挂起。
async fn run_consumer(shared: Arc<EngineShared>, mut raw_rx: mpsc::Receiver<RawNotification>) {
    debug!("通知消费任务启动: {:?}", shared.root);

    loop {
        let raw = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            r = raw_rx.recv() => match r {
                Some(r) => r,
                None => break, // 通知源已关闭
            },
        };

        if shared.handle_notification(raw).await {
            break;
        }
    }

    debug!("通知消费任务退出: {:?}", shared.root);
}

impl EngineShared {
    /// 处理一条原始通知，返回 true 表示引擎应当自停
    async fn handle_notification(&self, raw: RawNotification) -> bool {
        {
            let st = self.state.lock().await;
            if !st.active || st.paused {
                // 暂停或已停止：丢弃，不缓冲
                return false;
            }
        }

        let Some(relative_path) = relative_to_root(&self.root, &raw.path) else {
            debug!("通知路径不在监视根之下，忽略: {:?}", raw.path);
            return false;
        };

        let item_type = ItemType::stat(&raw.path);
        let is_dir_now = item_type == ItemType::Directory;
        let flags = raw.flags;

        let mut kinds = ChangeKinds::default();
        if flags.delete {
            kinds.deleted = true;
        }
        if flags.rename {
            kinds.renamed = true;
        }
        if flags.attribute {
            kinds.attributes_changed = true;
        }
        // 目录的内容写入不算 modified，它触发子树发现
        if (flags.write || flags.extend) && !is_dir_now {
            kinds.modified = true;
        }

        // 先投递事件，再做任何有副作用的清理
        if kinds.any() {
            let event = ChangeEvent {
                absolute_path: raw.path.clone(),
                relative_path,
                root: self.root.clone(),
                kinds,
                item_type,
                raw: Some(raw.clone()),
                detected_at: chrono::Utc::now().timestamp(),
            };
            self.emit(event).await;
        }

        // 浅模式下只有根在监视表里，比对也只会发生在根上；新目录的
        // 注册在比对内部按模式把关
        if (flags.write || flags.extend) && is_dir_now {
            self.discover_children(&raw.path, true).await;
        }

        if kinds.deleted {
            let was_watched = {
                self.state.lock().await.watched.contains_key(&raw.path)
            };
            if was_watched {
                self.cleanup_deleted(&raw.path).await;
            }
            if raw.path == self.root {
                // 根被删除：事件已发出，引擎自停，事件流随之终止
                info!("监视根已删除，引擎自停: {:?}", self.root);
                self.shutdown().await;
                return true;
            }
        }

        false
    }

    /// 投递事件到回调接收器和事件流，顺序与消费顺序一致
    async fn emit(&self, event: ChangeEvent) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(cb) = callback {
            cb.deliver(&event).await;
        }

        if !self.stream_taken.load(Ordering::Relaxed) {
            return;
        }
        let tx = self.event_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                debug!("事件流接收端已关闭");
            }
        }
    }

    /// 目录写入通知后的子树发现
    ///
    /// 重新列目录、与已知子项集合求差，新出现的条目合成 created，
    /// 消失的条目合成 deleted（类型已不可判定，记为 Unknown）。
    /// `emit_events` 为 false 时只刷新基线，不发事件（恢复投递时用）。
    async fn discover_children(&self, dir: &Path, emit_events: bool) {
        // 列目录在锁外做
        let current = match list_child_names(dir) {
            Ok(c) => c,
            Err(_) => return, // 目录已消失，删除通知随后处理
        };

        let (mut added, mut removed, dir_rel) = {
            let mut st = self.state.lock().await;
            let Some(entry) = st.watched.get_mut(dir) else {
                return;
            };
            let added: Vec<String> = current
                .difference(&entry.known_children)
                .cloned()
                .collect();
            let removed: Vec<String> = entry
                .known_children
                .difference(&current)
                .cloned()
                .collect();
            entry.known_children = current;
            (added, removed, entry.relative_path.clone())
        };
        added.sort();
        removed.sort();

        for name in added {
            let child = dir.join(&name);
            let item_type = ItemType::stat(&child);

            if item_type == ItemType::Directory && self.mode == WatchMode::Recursive {
                // 新目录：注册它和它的后代。整棵搬进来的目录只建立监视
                // 基线，已有内容不补发 created 事件。
                self.register_discovered(&child).await;
            }

            if emit_events {
                debug!("发现新条目: {}/{}", dir_rel, name);
                self.emit(ChangeEvent {
                    absolute_path: child,
                    relative_path: join_rel(&dir_rel, &name),
                    root: self.root.clone(),
                    kinds: ChangeKinds::created(),
                    item_type,
                    raw: None,
                    detected_at: chrono::Utc::now().timestamp(),
                })
                .await;
            }
        }

        for name in removed {
            let child = dir.join(&name);

            if emit_events {
                self.emit(ChangeEvent {
                    absolute_path: child.clone(),
                    relative_path: join_rel(&dir_rel, &name),
                    root: self.root.clone(),
                    kinds: ChangeKinds::deleted(),
                    item_type: ItemType::Unknown,
                    raw: None,
                    detected_at: chrono::Utc::now().timestamp(),
                })
                .await;
            }

            // 消失的可能是受监视目录，事件发出后再清理
            let was_watched = { self.state.lock().await.watched.contains_key(&child) };
            if was_watched {
                self.cleanup_deleted(&child).await;
            }
        }
    }

    /// 注册动态发现的子树，尽力而为
    ///
    /// 运行期超出预算不致命：跳过该子树并记日志，树的其余部分保持
    /// 存活。无法枚举的子树同样静默跳过。
    async fn register_discovered(&self, top: &Path) {
        let mut stack = vec![top.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let over_budget = {
                let st = self.state.lock().await;
                st.watched.len() >= self.fd_budget
            };
            if over_budget {
                warn!("描述符预算用尽，子树不纳入监视: {:?}", dir);
                return;
            }

            let children = match list_child_names(&dir) {
                Ok(c) => c,
                Err(e) => {
                    debug!("无法枚举新子树 {:?}: {}", dir, e);
                    continue;
                }
            };

            if let Err(e) = self.source.register(&dir, self.classes) {
                warn!("注册新目录失败 {:?}: {}", dir, e);
                continue;
            }

            let Some(relative_path) = relative_to_root(&self.root, &dir) else {
                continue;
            };

            {
                let mut st = self.state.lock().await;
                st.watched.insert(
                    dir.clone(),
                    WatchedDirectory {
                        absolute_path: dir.clone(),
                        relative_path,
                        known_children: children.clone(),
                    },
                );
            }

            for name in &children {
                let child = dir.join(name);
                if let Ok(meta) = std::fs::symlink_metadata(&child) {
                    if meta.file_type().is_dir() {
                        stack.push(child);
                    }
                }
            }
        }
    }

    /// 把被删除的路径（及其下全部残留条目）移出监视表并注销
    async fn cleanup_deleted(&self, path: &Path) {
        let stale: Vec<PathBuf> = {
            let mut st = self.state.lock().await;
            let keys: Vec<PathBuf> = st
                .watched
                .keys()
                .filter(|k| k.starts_with(path))
                .cloned()
                .collect();
            for k in &keys {
                st.watched.remove(k);
            }
            keys
        };

        for p in &stale {
            self.source.unregister(p);
        }

        if !stale.is_empty() {
            debug!("注销 {} 个已删除的监视目录: {:?}", stale.len(), path);
        }
    }

    /// 恢复投递前刷新全部子项快照
    ///
    /// 暂停期间的增删被静默吸收：新目录建立监视基线，消失的目录被
    /// 注销，都不产生事件。
    async fn rebaseline(&self) {
        let dirs: Vec<PathBuf> = {
            let st = self.state.lock().await;
            st.watched.keys().cloned().collect()
        };

        for dir in dirs {
            self.discover_children(&dir, false).await;
        }

        debug!("快照基线已刷新: {:?}", self.root);
    }

    /// 根被删除时的自停
    async fn shutdown(&self) {
        let paths: Vec<PathBuf> = {
            let mut st = self.state.lock().await;
            st.active = false;
            st.watched.drain().map(|(k, _)| k).collect()
        };

        for p in &paths {
            self.source.unregister(p);
        }

        self.cancel.cancel();
        self.event_tx.lock().unwrap().take();
    }
}
