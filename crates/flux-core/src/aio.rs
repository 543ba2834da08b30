//! 单次可取消异步操作原语（Aio）。
//!
//! ## 设计背景（Why）
//! - 管道、拨号器、监听器与套接字之间流通的统一"货币"是一次性异步操作：
//!   发起方持有 [`Aio`] 句柄，消费方持有 [`AioCompleter`]，后者恰好完成一次；
//! - 回调式 C 实现常见的 use-after-complete 缺陷，在这里被所有权移交消解：
//!   完成器按值消耗，重复完成在类型层面不可表达（`BadState` 无从构造）。
//!
//! ## 逻辑解析（How）
//! - 内部状态是受 `parking_lot::Mutex` 保护的三态槽位
//!   `Pending → Done → Taken`，取消、超时与自然完成都经由同一条
//!   `settle` 路径做先完成者获胜仲裁；
//! - 截止时间通过守望任务建模：定时器先到则以 `Timeout` 结算，操作先
//!   结算则唤醒守望任务退出，二者对消费方不可区分；
//! - 结果经唤醒投递到等待方所在线程，结算方从不在持锁状态下执行
//!   等待方逻辑，完成路径天然不可重入。

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 操作的最迟完成时间，`none` 表示不设硬超时。
///
/// ## 契约（What）
/// - 以单调时钟（[`tokio::time::Instant`]）表达绝对时间点，测试可借助
///   Tokio 的暂停时钟推进；
/// - 截止触发后的完成结果固定为 [`CoreError::Timeout`]，对消费者而言与
///   显式取消同义。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 不设截止时间。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 指定绝对截止时间点。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以当前时刻加偏移构造截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// 返回内部时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

enum Slot<T> {
    Pending,
    Done(CoreResult<T>),
    Taken,
}

struct AioShared<T> {
    slot: Mutex<Slot<T>>,
    /// 唤醒 `wait` 侧。`notify_one` 携带许可，结算先于等待也不丢失。
    ready: Notify,
    /// 唤醒守望任务与 `AioCompleter::settled`。
    settled: Notify,
}

impl<T> AioShared<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Notify::new(),
            settled: Notify::new(),
        }
    }

    /// 先完成者获胜的唯一结算入口。
    ///
    /// 赢得结算返回 `None`；输掉仲裁时原样归还结果，调用方可借此把未
    /// 消费的资源（如出队的消息）放回原处，并停止触碰操作缓冲区。
    fn settle(&self, result: CoreResult<T>) -> Option<CoreResult<T>> {
        {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Pending => *slot = Slot::Done(result),
                _ => return Some(result),
            }
        }
        self.ready.notify_one();
        self.settled.notify_waiters();
        None
    }

    fn is_settled(&self) -> bool {
        !matches!(&*self.slot.lock(), Slot::Pending)
    }
}

/// 发起方持有的操作句柄。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把"操作属于唯一所有者、恰好完成一次"的纪律落到类型上：句柄留在
///   发起方，完成器移交给唯一消费者；
/// - 取消与超时竞争自然完成时，由内部槽位做原子仲裁，输家的结果被抑制。
///
/// ## 契约（What）
/// - [`wait`](Aio::wait) 恰好解析一次，结果为成功、[`Canceled`]、
///   [`Timeout`] 或消费方上报的错误之一；
/// - [`cancel`](Aio::cancel) 可与自然完成并发调用，幂等；
/// - 守望定时器随句柄结算或销毁一并回收，运行时不会保留已完成的操作。
///
/// [`Canceled`]: CoreError::Canceled
/// [`Timeout`]: CoreError::Timeout
pub struct Aio<T> {
    shared: Arc<AioShared<T>>,
    timer: Option<JoinHandle<()>>,
    detached: bool,
}

impl<T: Send + 'static> Aio<T> {
    /// 创建操作句柄与完成器，并按截止时间武装守望定时器。
    pub fn pair(deadline: Deadline) -> (Aio<T>, AioCompleter<T>) {
        let shared = Arc::new(AioShared::new());
        let timer = deadline.instant().map(|at| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let settled = shared.settled.notified();
                tokio::pin!(settled);
                settled.as_mut().enable();
                if shared.is_settled() {
                    return;
                }
                tokio::select! {
                    _ = &mut settled => {}
                    _ = tokio::time::sleep_until(at) => {
                        shared.settle(Err(CoreError::Timeout));
                    }
                }
            })
        });
        let completer = AioCompleter {
            shared: Arc::clone(&shared),
            fired: false,
        };
        (
            Aio {
                shared,
                timer,
                detached: false,
            },
            completer,
        )
    }

    /// 请求取消；若尚未结算则立即以 [`CoreError::Canceled`] 完成。
    ///
    /// 返回 `true` 表示本次调用赢得结算。
    pub fn cancel(&self) -> bool {
        self.shared.settle(Err(CoreError::Canceled)).is_none()
    }

    /// 查询操作是否已结算（含取消与超时）。
    pub fn is_settled(&self) -> bool {
        self.shared.is_settled()
    }

    /// 放弃对结果的观察但让操作照常执行（即发即忘）。
    ///
    /// 与直接丢弃句柄不同：丢弃等同取消，消费方会跳过该操作；解除
    /// 关注后消费方照常完成，结果被丢弃。
    pub fn detach(mut self) {
        self.detached = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// 等待操作完成并取出唯一结果。
    pub async fn wait(mut self) -> CoreResult<T> {
        let result = loop {
            // 先注册唤醒，再检查槽位，避免结算与注册之间的窗口丢失。
            let ready = self.shared.ready.notified();
            {
                let mut slot = self.shared.slot.lock();
                if matches!(&*slot, Slot::Done(_)) {
                    match std::mem::replace(&mut *slot, Slot::Taken) {
                        Slot::Done(result) => break result,
                        _ => unreachable!("slot state checked under the same lock"),
                    }
                }
            }
            ready.await;
        };
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        result
    }
}

impl<T> Drop for Aio<T> {
    fn drop(&mut self) {
        // 句柄失踪等同取消：消费方此后的 try_complete 必须输掉仲裁并
        // 收回结果中的资源，否则完成值写进无人读取的槽位即告丢失。
        if !self.detached {
            let _ = self.shared.settle(Err(CoreError::Canceled));
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl<T> std::fmt::Debug for Aio<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aio")
            .field("settled", &self.shared.is_settled())
            .finish()
    }
}

/// 消费方持有的完成器，按值消耗以保证恰好完成一次。
///
/// ## 契约（What）
/// - [`complete`](AioCompleter::complete) 消耗自身；若操作已被取消或超时，
///   结果被丢弃并返回 `false`；
/// - 未经完成即销毁时，自动以 [`CoreError::Closed`] 结算——运行时的活性
///   契约（任何操作最终都有完成）由此兜底；
/// - 消费方应在阻塞点轮询 [`is_settled`](AioCompleter::is_settled) 或等待
///   [`settled`](AioCompleter::settled)，一旦结算立即停止触碰缓冲区。
pub struct AioCompleter<T> {
    shared: Arc<AioShared<T>>,
    fired: bool,
}

impl<T> AioCompleter<T> {
    /// 交付完成结果；返回 `false` 表示取消/超时已抢先结算。
    pub fn complete(self, result: CoreResult<T>) -> bool {
        self.try_complete(result).is_none()
    }

    /// 交付完成结果；输掉仲裁时归还结果，供调用方回收其中的资源。
    pub fn try_complete(mut self, result: CoreResult<T>) -> Option<CoreResult<T>> {
        self.fired = true;
        self.shared.settle(result)
    }

    /// 查询操作是否已被对侧结算。
    pub fn is_settled(&self) -> bool {
        self.shared.is_settled()
    }

    /// 等待操作结算（通常用于在长阻塞中感知取消）。
    pub async fn settled(&self) {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            // 先登记唤醒再检查状态，封死 notify_waiters 与登记之间的窗口。
            notified.as_mut().enable();
            if self.shared.is_settled() {
                return;
            }
            notified.await;
        }
    }
}

impl<T> Drop for AioCompleter<T> {
    fn drop(&mut self) {
        if !self.fired {
            let _ = self.shared.settle(Err(CoreError::Closed));
        }
    }
}

impl<T> std::fmt::Debug for AioCompleter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioCompleter")
            .field("settled", &self.shared.is_settled())
            .finish()
    }
}

/// 组件级关闭令牌，统一表达"正在关闭"的广播语义。
///
/// ## 意图（Why）
/// - 拨号器、监听器与套接字的关闭都需要同时满足两点：挂起的异步等待被
///   唤醒、后续快速路径能以标志位短路；
/// - 原子位提供可见性，`Notify` 提供唤醒，两者共同构成最小可行解。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于未触发状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发取消；首次触发返回 `true`，此后幂等返回 `false`。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 查询是否已触发。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 挂起直到令牌被触发；已触发时立即返回。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
