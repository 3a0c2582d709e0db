//! 软件时钟设备
//!
//! 用独立线程按回调周期调用 sink，模拟声卡的固定节奏。
//! 没有声卡的环境（CI、无头服务器）和端到端测试都用它。
//! 输出默认丢弃，可选地写入一个有界的 capture tap 供检查。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_utils::Backoff;

use super::{DeviceBinding, DeviceError, DeviceStream};
use crate::alloc;
use crate::audio::format::StreamFormat;
use crate::audio::ring_buffer::{CacheLine, RingBuffer};
use crate::audio::sink::RealtimeSink;

/// 渲染输出的旁路
///
/// 时钟线程是唯一写者，持有 tap 的一方是唯一读者。
/// 满了之后多余的输出直接丢弃，回调线程上不分配。
#[derive(Clone)]
pub struct CaptureTap {
    buffer: Arc<RingBuffer<f32>>,
}

impl CaptureTap {
    fn new(max_frames: usize) -> Self {
        Self {
            buffer: Arc::new(RingBuffer::with_min_capacity(max_frames * 2)),
        }
    }

    /// 取出目前捕获到的全部交织样本
    pub fn drain(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.buffer.read_available()];
        let n = self.buffer.read(&mut out);
        out.truncate(n);
        out
    }

    /// 已捕获但未取出的帧数
    pub fn frames_available(&self) -> usize {
        self.buffer.read_available() / 2
    }
}

/// 软件时钟设备绑定
#[derive(Default)]
pub struct ClockedDevice {
    capture_frames: Option<usize>,
    last_tap: Option<CaptureTap>,
}

impl ClockedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为之后打开的流附加最多 `max_frames` 帧的 capture tap
    pub fn with_capture(max_frames: usize) -> Self {
        Self {
            capture_frames: Some(max_frames),
            last_tap: None,
        }
    }

    /// 最近一次打开的流的 capture tap
    pub fn capture_tap(&self) -> Option<CaptureTap> {
        self.last_tap.clone()
    }
}

impl DeviceBinding for ClockedDevice {
    fn open(
        &mut self,
        format: &StreamFormat,
        sink: RealtimeSink,
    ) -> Result<Box<dyn DeviceStream>, DeviceError> {
        if format.frames_per_callback == 0 || format.sample_rate == 0 {
            return Err(DeviceError::UnsupportedFormat(format!(
                "{} frames @ {}Hz",
                format.frames_per_callback, format.sample_rate
            )));
        }

        let tap = self.capture_frames.map(CaptureTap::new);
        self.last_tap = tap.clone();

        let stream = ClockedStream::spawn(*format, sink, tap)?;
        log::debug!(
            "Clocked device opened: {}Hz, {} frames/callback ({:?} period)",
            format.sample_rate,
            format.frames_per_callback,
            format.callback_period()
        );
        Ok(Box::new(stream))
    }
}

struct Shared {
    running: CacheLine<AtomicBool>,
    in_callback: CacheLine<AtomicBool>,
    shutdown: AtomicBool,
}

/// 软件时钟设备流
pub struct ClockedStream {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ClockedStream {
    fn spawn(
        format: StreamFormat,
        sink: RealtimeSink,
        tap: Option<CaptureTap>,
    ) -> Result<Self, DeviceError> {
        let shared = Arc::new(Shared {
            running: CacheLine::new(AtomicBool::new(false)),
            in_callback: CacheLine::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("clocked-device".to_string())
            .spawn(move || clock_thread_main(format, sink, tap, thread_shared))
            .map_err(|e| DeviceError::Open(format!("failed to spawn clock thread: {}", e)))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn shutdown(&mut self) -> Result<(), DeviceError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.running.0.store(false, Ordering::SeqCst);
        thread.thread().unpark();

        thread
            .join()
            .map_err(|_| DeviceError::Close("clock thread panicked".to_string()))
    }
}

impl DeviceStream for ClockedStream {
    fn start(&mut self) -> Result<(), DeviceError> {
        let Some(thread) = self.thread.as_ref() else {
            return Err(DeviceError::Start("stream already closed".to_string()));
        };

        self.shared.running.0.store(true, Ordering::SeqCst);
        thread.thread().unpark();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.shared.running.0.store(false, Ordering::SeqCst);

        // 等待正在执行的回调结束，返回后不会再有回调
        let backoff = Backoff::new();
        while self.shared.in_callback.0.load(Ordering::SeqCst) {
            backoff.snooze();
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.thread.is_some() && self.shared.running.0.load(Ordering::Acquire)
    }

    fn close(mut self: Box<Self>) -> Result<(), DeviceError> {
        self.shutdown()
    }
}

impl Drop for ClockedStream {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Clocked device teardown: {}", e);
        }
    }
}

/// 时钟线程主函数
///
/// 按截止时间调度：每次回调后截止时间前进一个周期，
/// 落后超过一个周期时重新对齐，不做追赶式的连续回调。
fn clock_thread_main(
    format: StreamFormat,
    mut sink: RealtimeSink,
    tap: Option<CaptureTap>,
    shared: Arc<Shared>,
) {
    let period = format.callback_period();
    // 在标记实时之前完成全部分配
    let mut buffer = vec![0.0f32; format.samples_per_callback()];
    let mut deadline: Option<Instant> = None;

    alloc::mark_realtime_thread();

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        shared.in_callback.0.store(true, Ordering::SeqCst);
        if !shared.running.0.load(Ordering::SeqCst) {
            shared.in_callback.0.store(false, Ordering::SeqCst);
            deadline = None;
            thread::park();
            continue;
        }

        let now = Instant::now();
        let due = *deadline.get_or_insert(now);
        if due > now {
            shared.in_callback.0.store(false, Ordering::SeqCst);
            thread::sleep(due - now);
            continue;
        }

        sink.render(&mut buffer);
        if let Some(tap) = &tap {
            tap.buffer.write(&buffer);
        }
        shared.in_callback.0.store(false, Ordering::SeqCst);

        let next = due + period;
        deadline = Some(if now.saturating_duration_since(next) > period {
            now + period
        } else {
            next
        });
    }

    alloc::unmark_realtime_thread();
}
