//! 哈希时间轮
//!
//! `TimingWheel` 只负责分桶与推进，不感知真实时间；`HashedWheelTimer` 用 tokio 定时器按固定粒度推进。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

struct WheelEntry<T> {
    remaining_rounds: u64,
    item: T,
}

pub struct TimingWheel<T> {
    tick: Duration,
    buckets: Vec<Vec<WheelEntry<T>>>,
    cursor: usize,
    len: usize,
}

impl<T> TimingWheel<T> {
    pub fn new(tick: Duration, wheel_size: usize) -> Self {
        let wheel_size = wheel_size.max(1);
        let tick = if tick.is_zero() {
            Duration::from_millis(1)
        } else {
            tick
        };
        Self {
            tick,
            buckets: (0..wheel_size).map(|_| Vec::new()).collect(),
            cursor: 0,
            len: 0,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 延迟换算为 tick 数（至少1），超过一圈的用剩余圈数表示
    pub fn schedule(&mut self, delay: Duration, item: T) {
        let size = self.buckets.len() as u64;
        let ticks = (delay.as_nanos().div_ceil(self.tick.as_nanos()) as u64).max(1);
        let index = ((self.cursor as u64 + ticks) % size) as usize;
        let remaining_rounds = (ticks - 1) / size;

        self.buckets[index].push(WheelEntry {
            remaining_rounds,
            item,
        });
        self.len += 1;
    }

    /// 推进一格，返回到期的条目
    pub fn advance(&mut self) -> Vec<T> {
        self.cursor = (self.cursor + 1) % self.buckets.len();
        let bucket = std::mem::take(&mut self.buckets[self.cursor]);

        let mut expired = Vec::new();
        for mut entry in bucket {
            if entry.remaining_rounds == 0 {
                expired.push(entry.item);
            } else {
                entry.remaining_rounds -= 1;
                self.buckets[self.cursor].push(entry);
            }
        }
        self.len -= expired.len();
        expired
    }
}

/// 由 tokio interval 驱动的时间轮，到期条目交给处理函数
pub struct HashedWheelTimer<T> {
    wheel: Mutex<TimingWheel<T>>,
}

impl<T: Send + 'static> HashedWheelTimer<T> {
    pub fn new(tick: Duration, wheel_size: usize) -> Self {
        Self {
            wheel: Mutex::new(TimingWheel::new(tick, wheel_size)),
        }
    }

    pub async fn new_timeout(&self, delay: Duration, item: T) {
        self.wheel.lock().await.schedule(delay, item);
    }

    pub async fn pending(&self) -> usize {
        self.wheel.lock().await.len()
    }

    /// 启动推进循环，收到停机信号后退出
    pub fn start<F>(
        self: &Arc<Self>,
        on_expired: F,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let timer = Arc::clone(self);
        tokio::spawn(async move {
            let tick = timer.wheel.lock().await.tick();
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
            info!("时间轮启动, tick={:?}", tick);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = timer.wheel.lock().await.advance();
                        if !expired.is_empty() {
                            debug!("时间轮到期条目: {}", expired.len());
                        }
                        for item in expired {
                            on_expired(item);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("时间轮收到停机信号");
                        break;
                    }
                }
            }
        })
    }
}
