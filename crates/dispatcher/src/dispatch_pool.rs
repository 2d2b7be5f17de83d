//! 有界下发线程池：队列满时立即拒绝，不阻塞提交方

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::Task;

/// 下发池取出任务后的处理方
#[async_trait]
pub trait TaskDispatchHandler: Send + Sync {
    async fn dispatch_task(&self, task: Task);

    /// 队列已满，任务未进入下发流程
    async fn reject_task(&self, task: Task);
}

pub struct DispatchPool {
    sender: mpsc::Sender<Task>,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    handler: OnceLock<Weak<dyn TaskDispatchHandler>>,
    concurrency: usize,
}

impl DispatchPool {
    pub fn new(concurrency: usize, queue_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            handler: OnceLock::new(),
            concurrency: concurrency.max(1),
        }
    }

    /// 处理方持有下发池，这里只保留弱引用
    pub fn bind_handler(&self, handler: Weak<dyn TaskDispatchHandler>) -> SchedulerResult<()> {
        self.handler
            .set(handler)
            .map_err(|_| SchedulerError::internal("下发池已绑定处理方"))
    }

    fn handler(&self) -> Option<Arc<dyn TaskDispatchHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    /// 尝试入队，队列满时交给处理方的 reject_task 并返回 ResourceExhausted
    pub async fn try_submit(&self, task: Task) -> SchedulerResult<()> {
        match self.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => {
                metrics::counter!("jobflow_dispatch_rejected_total").increment(1);
                warn!("下发队列已满，拒绝任务 {}", task.id);
                let task_id = task.id.clone();
                if let Some(handler) = self.handler() {
                    handler.reject_task(task).await;
                }
                Err(SchedulerError::ResourceExhausted(format!(
                    "下发队列已满: {task_id}"
                )))
            }
            Err(mpsc::error::TrySendError::Closed(task)) => Err(SchedulerError::internal(
                format!("下发池已关闭: {}", task.id),
            )),
        }
    }

    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// 启动固定数量的下发协程，收到停机信号后退出。需先调用 bind_handler
    pub fn start(&self, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!("启动下发池，并发数: {}", self.concurrency);
        (0..self.concurrency)
            .map(|index| {
                let receiver = Arc::clone(&self.receiver);
                let handler = self.handler.get().cloned();
                let mut shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            task = async { receiver.lock().await.recv().await } => task,
                            _ = shutdown_rx.recv() => {
                                debug!("下发协程 {} 退出", index);
                                break;
                            }
                        };
                        let Some(task) = next else {
                            break;
                        };
                        match handler.as_ref().and_then(Weak::upgrade) {
                            Some(handler) => handler.dispatch_task(task).await,
                            None => {
                                error!("下发池未绑定处理方，丢弃任务 {}", task.id);
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_testing_utils::{TaskBuilder, TestEnv};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        dispatched: std::sync::Mutex<Vec<String>>,
        rejected: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskDispatchHandler for Recorder {
        async fn dispatch_task(&self, task: Task) {
            self.dispatched.lock().unwrap().push(task.id);
        }

        async fn reject_task(&self, task: Task) {
            self.rejected.lock().unwrap().push(task.id);
        }
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let pool = DispatchPool::new(1, 2);
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn TaskDispatchHandler> = recorder.clone();
        pool.bind_handler(Arc::downgrade(&handler)).unwrap();

        pool.try_submit(TaskBuilder::new("t1").build()).await.unwrap();
        pool.try_submit(TaskBuilder::new("t2").build()).await.unwrap();
        let err = pool
            .try_submit(TaskBuilder::new("t3").build())
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::ResourceExhausted(_)));
        assert_eq!(*recorder.rejected.lock().unwrap(), vec!["t3".to_string()]);
        assert_eq!(pool.queued(), 2);
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let pool = DispatchPool::new(2, 16);
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn TaskDispatchHandler> = recorder.clone();
        pool.bind_handler(Arc::downgrade(&handler)).unwrap();
        assert!(pool.bind_handler(Arc::downgrade(&handler)).is_err());

        let (shutdown_tx, _) = broadcast::channel(1);
        let handles = pool.start(&shutdown_tx);
        for i in 0..5 {
            pool.try_submit(TaskBuilder::new(&format!("t{i}")).build())
                .await
                .unwrap();
        }

        let r = recorder.clone();
        let drained = TestEnv::wait_for(
            move || {
                let r = r.clone();
                async move { r.dispatched.lock().unwrap().len() == 5 }
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(drained);

        shutdown_tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
