/// 隧道准入控制
///
/// 计数存活的隧道，超过上限的请求按 FIFO 排队，每关闭一条隧道放行一个。
/// 计数递减和出队在同一把锁内完成，释放的名额不会被并发准入抢走
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// 排队请求的启动回调
pub type StartFn = Box<dyn FnOnce() + Send + 'static>;

struct Waiter {
    id: u64,
    start: StartFn,
}

struct AdmissionState {
    active: usize,
    queue: VecDeque<Waiter>,
}

/// 准入队列
pub struct AdmissionQueue {
    max_tunnels: Option<usize>,
    state: Mutex<AdmissionState>,
}

impl AdmissionQueue {
    /// 创建准入队列（max_tunnels 为 None 时不限制）
    pub fn new(max_tunnels: Option<usize>) -> Self {
        Self {
            max_tunnels,
            state: Mutex::new(AdmissionState {
                active: 0,
                queue: VecDeque::new(),
            }),
        }
    }

    /// 申请一个隧道名额
    ///
    /// 有名额时立即计数并调用 start，返回 true；
    /// 否则把 start 排入 FIFO，返回 false
    pub fn admit(&self, id: u64, start: StartFn) -> bool {
        {
            let mut state = self.state.lock().expect("admission lock poisoned");
            if self.max_tunnels.map_or(true, |max| state.active < max) {
                state.active += 1;
            } else {
                debug!("Tunnel #{} queued (active at cap)", id);
                state.queue.push_back(Waiter { id, start });
                return false;
            }
        }

        // 启动回调在锁外调用
        start();
        true
    }

    /// 释放一个名额（隧道关闭时调用），并启动一个排队请求
    pub fn release(&self) {
        let next = {
            let mut state = self.state.lock().expect("admission lock poisoned");
            state.active = state.active.saturating_sub(1);
            if let Some(waiter) = state.queue.pop_front() {
                // 出队者直接接手名额，期间锁未释放
                state.active += 1;
                Some(waiter)
            } else {
                None
            }
        };

        if let Some(waiter) = next {
            debug!("Tunnel #{} dequeued", waiter.id);
            (waiter.start)();
        }
    }

    /// 撤销一个仍在排队的请求（名额从未占用，计数不变）
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock().expect("admission lock poisoned");
        let before = state.queue.len();
        state.queue.retain(|waiter| waiter.id != id);
        before != state.queue.len()
    }

    /// 当前存活的隧道数
    pub fn active(&self) -> usize {
        self.state.lock().expect("admission lock poisoned").active
    }

    /// 当前排队的请求数
    pub fn queued(&self) -> usize {
        self.state.lock().expect("admission lock poisoned").queue.len()
    }
}
