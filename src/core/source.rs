//! 通知源抽象
//!
//! 底层的逐路径文件事件原语被抽象成 NotificationSource：注册/注销、
//! 暂停/恢复投递，事件通过构造时返回的通道流出。生产实现由 notify
//! 支撑；测试可以注入任意实现。

use crate::config::NotifyClasses;
use crate::core::events::{ChangeEvent, NotifyFlags, RawNotification};
use crate::error::WatchError;
use async_trait::async_trait;
use notify::event::{DataChange, ModifyKind};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// 逐路径通知源
///
/// 注册是排他的：一个路径只应被一个引擎注册，两个引擎并发注册同一
/// 路径的行为未定义。
pub trait NotificationSource: Send + Sync {
    /// 注册路径，按订阅类别投递该路径上的通知
    fn register(&self, path: &Path, classes: NotifyClasses) -> Result<(), WatchError>;

    /// 停止监视路径
    fn unregister(&self, path: &Path);

    /// 暂停投递（注册保持打开，期间的事件被丢弃）
    fn pause_delivery(&self);

    /// 恢复投递
    fn resume_delivery(&self);
}

/// 变更事件接收器 - 任何能接收 ChangeEvent 的对象
#[async_trait]
pub trait ChangeEventSink: Send + Sync {
    async fn deliver(&self, event: &ChangeEvent);
}

/// mpsc 发送端直接作为接收器使用
#[async_trait]
impl ChangeEventSink for mpsc::Sender<ChangeEvent> {
    async fn deliver(&self, event: &ChangeEvent) {
        let _ = self.send(event.clone()).await;
    }
}

/// notify 支撑的生产通知源
///
/// 每个已注册路径对应一个非递归监视；notify 回调里把原始事件归一化
/// 为（已注册路径，标志）后送入通道。
pub struct DirectoryNotifySource {
    watcher: Mutex<RecommendedWatcher>,
    registered: Arc<Mutex<HashMap<PathBuf, NotifyClasses>>>,
    paused: Arc<AtomicBool>,
}

impl DirectoryNotifySource {
    /// 创建通知源，返回源本身和事件接收端
    pub fn new(buffer: usize) -> Result<(Arc<Self>, mpsc::Receiver<RawNotification>), WatchError> {
        let (tx, rx) = mpsc::channel(buffer);
        let registered: Arc<Mutex<HashMap<PathBuf, NotifyClasses>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let paused = Arc::new(AtomicBool::new(false));

        let cb_registered = registered.clone();
        let cb_paused = paused.clone();

        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    // 暂停期间直接丢弃，不缓冲
                    if cb_paused.load(Ordering::Relaxed) {
                        return;
                    }

                    let targets = {
                        let reg = cb_registered.lock().unwrap();
                        normalize_event(&event, &reg)
                    };

                    for raw in targets {
                        if tx.try_send(raw).is_err() {
                            warn!("通知通道已满或已关闭，丢弃事件");
                        }
                    }
                }
                Err(e) => warn!("通知源错误: {}", e),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| WatchError::RegisterFailed(e.to_string()))?;

        let source = Arc::new(Self {
            watcher: Mutex::new(watcher),
            registered,
            paused,
        });

        Ok((source, rx))
    }
}

impl NotificationSource for DirectoryNotifySource {
    fn register(&self, path: &Path, classes: NotifyClasses) -> Result<(), WatchError> {
        self.watcher
            .lock()
            .unwrap()
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::RegisterFailed(format!("{}: {}", path.display(), e)))?;

        self.registered
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), classes);

        Ok(())
    }

    fn unregister(&self, path: &Path) {
        // 路径可能已经消失，注销失败不致命
        let _ = self.watcher.lock().unwrap().unwatch(path);
        self.registered.lock().unwrap().remove(path);
    }

    fn pause_delivery(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    fn resume_delivery(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }
}

/// 把一条 notify 事件归一化为若干条原始通知
///
/// 规则：
/// - 事件路径本身已注册：按事件种类直接映射标志；
/// - 事件路径的父目录已注册：结构性变化（创建/删除/改名）归一化为
///   父目录上的 write（由引擎做快照比对），内容/属性变化保留在
///   子路径上；
/// - 两者都不满足：丢弃。
///
/// 标志会按触发注册的那条订阅做类别过滤，同一路径的多条标志合并。
fn normalize_event(
    event: &Event,
    registered: &HashMap<PathBuf, NotifyClasses>,
) -> Vec<RawNotification> {
    let mut merged: Vec<(PathBuf, NotifyFlags)> = Vec::new();

    let mut push = |path: &Path, flags: NotifyFlags, classes: &NotifyClasses| {
        let flags = flags.intersect(classes);
        if !flags.any() {
            return;
        }
        if let Some(entry) = merged.iter_mut().find(|(p, _)| p == path) {
            entry.1.merge(flags);
        } else {
            merged.push((path.to_path_buf(), flags));
        }
    };

    for path in &event.paths {
        if let Some(classes) = registered.get(path.as_path()) {
            // 已注册路径自身的变化
            if let Some(flags) = direct_flags(&event.kind) {
                push(path, flags, classes);
            }
            continue;
        }

        let Some(parent) = path.parent() else {
            continue;
        };
        let Some(classes) = registered.get(parent) else {
            continue;
        };

        match &event.kind {
            // 目录内条目的增删改名：表现为父目录的内容写入
            EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                push(parent, NotifyFlags::write(), classes);
            }
            EventKind::Modify(ModifyKind::Data(DataChange::Size)) => {
                let mut flags = NotifyFlags::write();
                flags.merge(NotifyFlags::extend());
                push(path, flags, classes);
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                push(path, NotifyFlags::attribute(), classes);
            }
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
                push(path, NotifyFlags::write(), classes);
            }
            EventKind::Access(_) => {}
        }
    }

    merged
        .into_iter()
        .map(|(path, flags)| RawNotification { path, flags })
        .collect()
}

/// 已注册路径自身的事件种类 → 标志
fn direct_flags(kind: &EventKind) -> Option<NotifyFlags> {
    match kind {
        EventKind::Remove(_) => Some(NotifyFlags::delete()),
        EventKind::Modify(ModifyKind::Name(_)) => Some(NotifyFlags::rename()),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(NotifyFlags::attribute()),
        EventKind::Modify(ModifyKind::Data(DataChange::Size)) => {
            let mut flags = NotifyFlags::write();
            flags.merge(NotifyFlags::extend());
            Some(flags)
        }
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any | EventKind::Other => {
            Some(NotifyFlags::write())
        }
        EventKind::Access(_) => None,
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashSet;

    /// 测试用通知源：只记录注册状态，事件由测试方直接注入通道
    pub struct MockNotificationSource {
        pub registered: Mutex<HashSet<PathBuf>>,
        pub paused: AtomicBool,
    }

    impl MockNotificationSource {
        pub fn new() -> Self {
            Self {
                registered: Mutex::new(HashSet::new()),
                paused: AtomicBool::new(false),
            }
        }

        pub fn registered_count(&self) -> usize {
            self.registered.lock().unwrap().len()
        }
    }

    impl NotificationSource for MockNotificationSource {
        fn register(&self, path: &Path, _classes: NotifyClasses) -> Result<(), WatchError> {
            self.registered.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        fn unregister(&self, path: &Path) {
            self.registered.lock().unwrap().remove(path);
        }

        fn pause_delivery(&self) {
            self.paused.store(true, Ordering::Relaxed);
        }

        fn resume_delivery(&self) {
            self.paused.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn registered(paths: &[&str]) -> HashMap<PathBuf, NotifyClasses> {
        paths
            .iter()
            .map(|p| (PathBuf::from(p), NotifyClasses::default()))
            .collect()
    }

    #[test]
    fn test_child_create_becomes_parent_write() {
        let reg = registered(&["/watch/dir"]);
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/watch/dir/new.txt"));

        let out = normalize_event(&event, &reg);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, PathBuf::from("/watch/dir"));
        assert!(out[0].flags.write);
        assert!(!out[0].flags.delete);
    }

    #[test]
    fn test_registered_path_remove_maps_to_delete() {
        let reg = registered(&["/watch/dir"]);
        let event = Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(PathBuf::from("/watch/dir"));

        let out = normalize_event(&event, &reg);
        assert_eq!(out.len(), 1);
        assert!(out[0].flags.delete);
    }

    #[test]
    fn test_unrelated_path_is_dropped() {
        let reg = registered(&["/watch/dir"]);
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/elsewhere/new.txt"));

        assert!(normalize_event(&event, &reg).is_empty());
    }

    #[test]
    fn test_class_filter_drops_unsubscribed_flags() {
        let mut classes = NotifyClasses::default();
        classes.write = false;
        let mut reg = HashMap::new();
        reg.insert(PathBuf::from("/watch/dir"), classes);

        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/watch/dir/new.txt"));

        assert!(normalize_event(&event, &reg).is_empty());
    }
}
