//! 流式生产者
//!
//! 在普通线程上运行：从数据源拉取样本块，在不溢出的前提下写入左右声道，
//! 写不进去的部分留到下一轮。数据源耗尽（或收到停止信号）后进入排空阶段，
//! 等回调把缓冲区里的样本全部播完才返回。
//!
//! 这是整条链路上唯一允许阻塞的地方。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use crate::audio::format::StreamFormat;
use crate::audio::ring_buffer::RingBuffer;
use crate::audio::state::StreamState;
use crate::source::{Chunk, SampleSource};

/// 等待空间时，按这么多帧的空闲量估算等待时长
const WAIT_CHUNK_FRAMES: usize = 1024;

/// 生产者配置
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    /// 排空阶段多久没有进展就放弃（流已不再消费）
    pub drain_stall_timeout: Duration,
    /// 缓冲区读空后，在回调周期之外再多等的时间
    pub tail_padding: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            drain_stall_timeout: Duration::from_millis(500),
            tail_padding: Duration::from_millis(10),
        }
    }
}

/// 生产者结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// 数据源耗尽
    Exhausted,
    /// 收到外部停止信号
    Stopped,
}

/// 一次运行的汇总
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerReport {
    /// 写入两个声道的帧数
    pub frames_written: u64,
    /// 有帧被推迟到下一轮的写入次数
    pub deferrals: u64,
    pub outcome: ProducerOutcome,
    /// 排空阶段是否确认缓冲区已读空
    pub drained: bool,
}

/// 单次写入的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushStep {
    pub written: usize,
    pub deferred: usize,
}

/// 生产者进度，所有者线程可以随时读取
///
/// 完全基于原子操作
#[derive(Debug, Default)]
pub struct ProducerProgress {
    frames_written: AtomicU64,
    push_complete: AtomicBool,
    finished: AtomicBool,
    abandoned: AtomicBool,
}

impl ProducerProgress {
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// 写入阶段已结束（之后只剩排空）
    pub fn is_push_complete(&self) -> bool {
        self.push_complete.load(Ordering::Acquire)
    }

    /// 排空阶段也已结束
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 放弃这次运行：停止写入，并且跳过排空
    ///
    /// 设备流没能启动时使用，缓冲区里的样本不会再有人读取
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

/// 流式生产者（生产者侧句柄）
pub struct StreamingProducer {
    state: Arc<StreamState>,
    format: StreamFormat,
    stop_flag: Arc<AtomicBool>,
    config: ProducerConfig,
    progress: Arc<ProducerProgress>,
    pending_left: VecDeque<f32>,
    pending_right: VecDeque<f32>,
    deferrals: u64,
}

impl StreamingProducer {
    pub fn new(
        state: Arc<StreamState>,
        format: StreamFormat,
        stop_flag: Arc<AtomicBool>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            state,
            format,
            stop_flag,
            config,
            progress: Arc::new(ProducerProgress::default()),
            pending_left: VecDeque::new(),
            pending_right: VecDeque::new(),
            deferrals: 0,
        }
    }

    pub fn progress(&self) -> Arc<ProducerProgress> {
        Arc::clone(&self.progress)
    }

    /// 尚未写入声道的帧数
    pub fn pending_frames(&self) -> usize {
        self.pending_left.len().min(self.pending_right.len())
    }

    /// 把一块样本加入待写队列
    pub fn offer(&mut self, chunk: Chunk) {
        self.pending_left.extend(chunk.left());
        self.pending_right.extend(chunk.right());
    }

    /// 尝试写入一次
    ///
    /// 可写帧数 = min(待写帧数, 左声道可写, 右声道可写)，两个声道写入相同数量，
    /// 保持帧对齐。写不下的部分留在队列里。之后按两个声道是否都还有空间更新 ready。
    pub fn push_pending(&mut self) -> PushStep {
        let pending = self.pending_frames();
        let writable = pending
            .min(self.state.left().write_available())
            .min(self.state.right().write_available());

        if writable > 0 {
            let left = write_from_queue(self.state.left(), &mut self.pending_left, writable);
            let right = write_from_queue(self.state.right(), &mut self.pending_right, writable);
            debug_assert_eq!(left, writable);
            debug_assert_eq!(right, writable);
            self.progress
                .frames_written
                .fetch_add(writable as u64, Ordering::Relaxed);
        }

        let deferred = pending - writable;
        if deferred > 0 {
            self.deferrals += 1;
        }

        // 建议性标志，CAS 失败说明回调同时改了它，忽略即可
        self.state.update_ready(self.state.frames_writable() > 0);

        PushStep {
            written: writable,
            deferred,
        }
    }

    /// 运行到数据源耗尽或收到停止信号，然后排空
    pub fn run<S: SampleSource + ?Sized>(&mut self, source: &mut S) -> ProducerReport {
        let ns_per_frame = 1_000_000_000 / self.format.sample_rate.max(1) as u64;

        log::info!(
            "Producer started: capacity {} frames, ~{}ns/frame",
            self.state.capacity(),
            ns_per_frame
        );

        let backoff = Backoff::new();
        let outcome = loop {
            if self.stop_flag.load(Ordering::Acquire) || self.progress.is_abandoned() {
                log::info!("Producer stop requested");
                break ProducerOutcome::Stopped;
            }

            if self.pending_frames() == 0 {
                match source.next_chunk() {
                    Some(chunk) => {
                        self.offer(chunk);
                        continue;
                    }
                    None => {
                        log::info!("Source exhausted");
                        break ProducerOutcome::Exhausted;
                    }
                }
            }

            let step = self.push_pending();
            if step.written > 0 {
                backoff.reset();
                continue;
            }

            self.wait_for_space(ns_per_frame, &backoff);
        };

        // 停止时丢弃未写入的部分
        self.pending_left.clear();
        self.pending_right.clear();
        self.progress.push_complete.store(true, Ordering::Release);

        let drained = self.drain();
        self.progress.finished.store(true, Ordering::Release);

        let report = ProducerReport {
            frames_written: self.progress.frames_written(),
            deferrals: self.deferrals,
            outcome,
            drained,
        };
        log::info!(
            "Producer finished: {} frames written, {} deferrals, {:?}",
            report.frames_written,
            report.deferrals,
            report.outcome
        );
        report
    }

    /// 自适应等待
    ///
    /// 根据还需要多少空闲空间和名义采样率估算等待时长：
    /// - < 50µs: 自旋（避免 syscall 开销）
    /// - 50-500µs: yield + 短自旋
    /// - 更长: 睡眠预计时间的 70%，限制在 100µs 到 10ms
    fn wait_for_space(&self, ns_per_frame: u64, backoff: &Backoff) {
        let needed = self
            .pending_frames()
            .min(WAIT_CHUNK_FRAMES)
            .saturating_sub(self.state.frames_writable());
        let wait_us = needed as u64 * ns_per_frame / 1_000;

        if wait_us < 50 {
            backoff.spin();
        } else if wait_us < 500 {
            thread::yield_now();
            backoff.spin();
        } else {
            let sleep_us = (wait_us * 7 / 10).clamp(100, 10_000);
            thread::sleep(Duration::from_micros(sleep_us));
        }
    }

    /// 排空阶段
    ///
    /// 轮询直到两个声道都读空，每轮按剩余样本数 / 采样率睡眠（至少 1ms）。
    /// 超过 `drain_stall_timeout` 没有进展则放弃。读空后再等一个回调周期
    /// 加上 `tail_padding`，覆盖已取出但还没播放出去的帧。
    fn drain(&self) -> bool {
        if self.progress.is_abandoned() {
            log::debug!("Run abandoned, skipping drain");
            return false;
        }

        let started = Instant::now();
        let mut last_remaining = self.state.samples_pending();
        let mut last_progress = started;

        log::debug!("Draining {} buffered frames", last_remaining);

        loop {
            let remaining = self.state.samples_pending();
            if remaining == 0 {
                break;
            }
            if self.progress.is_abandoned() {
                log::debug!("Run abandoned with {} frames buffered", remaining);
                return false;
            }

            if remaining < last_remaining {
                last_remaining = remaining;
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= self.config.drain_stall_timeout {
                log::warn!(
                    "Drain stalled with {} frames still buffered, giving up",
                    remaining
                );
                return false;
            }

            let sleep = self
                .format
                .frames_to_duration(remaining)
                .min(self.config.drain_stall_timeout)
                .max(Duration::from_millis(1));
            thread::sleep(sleep);
        }

        thread::sleep(self.format.callback_period() + self.config.tail_padding);
        log::debug!("Drain complete in {:?}", started.elapsed());
        true
    }
}

/// 从队列头部取 `count` 个样本写入声道，返回实际写入数
fn write_from_queue(ring: &RingBuffer<f32>, queue: &mut VecDeque<f32>, count: usize) -> usize {
    let (front, back) = queue.as_slices();
    let first = count.min(front.len());
    let mut written = ring.write(&front[..first]);
    if written == first && count > first {
        written += ring.write(&back[..count - first]);
    }
    queue.drain(..written);
    written
}
