//! 带确认机制的有界 job 队列
//!
//! 在 crossbeam 有界通道之上维护一个未完成计数：`put` 时加一，
//! worker 处理完（无论成功与否）调用 `task_done` 减一，`join` 阻塞直到计数归零。

use crate::error::{Result, TilerError};
use crate::pipeline::task_meta::TileCommand;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Default)]
struct Unfinished {
    count: Mutex<usize>,
    all_done: Condvar,
}

#[derive(Clone)]
pub struct JobQueue {
    tx: Sender<TileCommand>,
    rx: Receiver<TileCommand>,
    unfinished: Arc<Unfinished>,
}

impl JobQueue {
    /// 容量满时 `put` 会阻塞，形成对生产者的背压
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            unfinished: Arc::new(Unfinished::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn put(&self, command: TileCommand) -> Result<()> {
        *self.unfinished.count.lock() += 1;
        if self.tx.send(command).is_err() {
            self.task_done();
            return Err(TilerError::QueueDisconnected);
        }
        Ok(())
    }

    pub fn get(&self) -> Result<TileCommand> {
        self.rx.recv().map_err(|_| TilerError::QueueDisconnected)
    }

    pub fn task_done(&self) {
        let mut count = self.unfinished.count.lock();
        if *count == 0 {
            tracing::warn!("[JobQueue] task_done called more times than put");
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.unfinished.all_done.notify_all();
        }
    }

    /// 阻塞直到所有已入队的消息都被确认
    pub fn join(&self) {
        let mut count = self.unfinished.count.lock();
        while *count > 0 {
            self.unfinished.all_done.wait(&mut count);
        }
    }

    pub fn unfinished(&self) -> usize {
        *self.unfinished.count.lock()
    }
}
