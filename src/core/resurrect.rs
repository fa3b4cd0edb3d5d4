//! 单文件复活监视
//!
//! 被监视的文件删除后，它的注册随之失效；这里提供一个独立的轮询
//! 任务，周期性检查同一路径上是否重新出现了文件，出现即通过通道
//! 上报（由持有方完成重新注册），然后退出。与主消费任务完全独立，
//! 只共享「重新注册路径」这一个动作。

use crate::error::WatchError;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 单文件复活监视器
pub struct ResurrectionMonitor {
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
}

impl ResurrectionMonitor {
    /// 创建监视器
    ///
    /// 路径此刻不需要存在（它通常刚被删除）；但如果存在且不是普通
    /// 文件，说明监视前提已经不成立，直接报错。
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, WatchError> {
        let path = path.into();
        if path.exists() && !path.is_file() {
            return Err(WatchError::NotAFile(path));
        }

        Ok(Self {
            path,
            interval: poll_interval,
            cancel: CancellationToken::new(),
        })
    }

    /// 取消句柄，可在 run 移走 self 之后继续用来停掉轮询
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 运行轮询循环
    ///
    /// 文件重新出现时把路径发给 `reappear_tx` 并退出；被取消时直接
    /// 退出，不上报。调用方自行 spawn。
    pub async fn run(self, reappear_tx: mpsc::Sender<PathBuf>) {
        let mut timer = interval(self.interval);
        info!("开始复活监视: {:?} (间隔 {:?})", self.path, self.interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("复活监视被取消: {:?}", self.path);
                    return;
                }
                _ = timer.tick() => {}
            }

            if self.path.is_file() {
                info!("文件已重新出现: {:?}", self.path);
                let _ = reappear_tx.send(self.path.clone()).await;
                return;
            }
        }
    }
}
