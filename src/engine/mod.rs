//! 播放引擎
//!
//! 整合共享状态、设备流和生产者线程
//! 核心设计：生产者线程和设备回调完全解耦，通过每声道一个 lock-free ring buffer 连接

pub mod producer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::audio::{
    AudioStream, DeviceBinding, DeviceError, PlaybackStats, RealtimeSink, StatsReport,
    StreamFormat, StreamState,
};
use crate::source::SampleSource;

pub use producer::{
    ProducerConfig, ProducerOutcome, ProducerProgress, ProducerReport, PushStep,
    StreamingProducer,
};

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 名义采样率
    pub sample_rate: u32,
    /// 每次回调的帧数
    pub frames_per_callback: u32,
    /// 每个声道的 Ring buffer 大小（样本数，会被向上取整到 2 的幂）
    /// 越大越能抵抗生产者的调度抖动，但延迟也越高
    pub capacity: usize,
    /// 初始增益
    pub gain: f32,
    /// 预缓冲比例（0.0-1.0）
    /// 启动设备流之前需要填充到这个比例
    pub prebuffer_ratio: f64,
    /// 预缓冲最长等待时间
    pub prebuffer_timeout: Duration,
    /// 排空阶段多久没有进展就放弃
    pub drain_stall_timeout: Duration,
    /// 是否用 mlock 锁定缓冲区内存
    pub lock_memory: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frames_per_callback: 256,
            // ~3秒 @ 44.1kHz
            capacity: 131_072,
            gain: 0.1,
            // 25% 预缓冲
            prebuffer_ratio: 0.25,
            prebuffer_timeout: Duration::from_secs(2),
            drain_stall_timeout: Duration::from_millis(500),
            lock_memory: true,
        }
    }
}

impl EngineConfig {
    /// 每个声道容量上限（样本数，取整到 2 的幂之后），约 6 分钟 @ 44.1kHz
    pub const MAX_CAPACITY: usize = 1 << 24;

    /// 检查配置
    ///
    /// 容量小于一次回调的帧数或超过上限都是配置错误，在建立流之前就拒绝
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate == 0 {
            return Err(EngineError::Config("sample rate must be non-zero".to_string()));
        }
        if self.frames_per_callback == 0 {
            return Err(EngineError::Config(
                "frames per callback must be non-zero".to_string(),
            ));
        }
        if self.capacity < self.frames_per_callback as usize {
            return Err(EngineError::Config(format!(
                "capacity {} is smaller than one callback ({} frames)",
                self.capacity, self.frames_per_callback
            )));
        }
        match self.capacity.checked_next_power_of_two() {
            Some(rounded) if rounded <= Self::MAX_CAPACITY => {}
            _ => {
                return Err(EngineError::Config(format!(
                    "capacity {} exceeds the maximum of {} samples",
                    self.capacity,
                    Self::MAX_CAPACITY
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.prebuffer_ratio) {
            return Err(EngineError::Config(format!(
                "prebuffer ratio {} outside [0, 1]",
                self.prebuffer_ratio
            )));
        }
        Ok(())
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate, self.frames_per_callback)
    }

    /// 由毫秒数设置容量
    ///
    /// 乘法饱和，过大的值留给 `validate` 拒绝
    pub fn with_buffer_ms(mut self, ms: u64) -> Self {
        let samples = (self.sample_rate as u64).saturating_mul(ms) / 1000;
        self.capacity = usize::try_from(samples).unwrap_or(usize::MAX);
        self
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Failed to spawn producer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Producer thread panicked")]
    ProducerPanicked,
}

/// 播放引擎统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// 缓冲区填充比例
    pub buffer_fill_ratio: f64,
    /// 缓冲区中可读的帧数
    pub frames_buffered: usize,
    /// Underrun 次数
    pub underrun_count: u64,
    /// 已播放帧数
    pub frames_played: u64,
    /// 生产者已写入帧数
    pub frames_written: u64,
    /// 当前播放时间（秒）
    pub position_secs: f64,
}

/// 播放引擎
///
/// 持有共享状态的所有者句柄，生产者线程和设备回调各持有一个 `Arc`。
pub struct Engine {
    config: EngineConfig,
    format: StreamFormat,
    state: Arc<StreamState>,
    stats: Arc<PlaybackStats>,
    stop_flag: Arc<AtomicBool>,
    stream: Option<AudioStream>,
    producer_thread: Option<JoinHandle<ProducerReport>>,
    progress: Option<Arc<ProducerProgress>>,
    last_report: Option<ProducerReport>,
    /// 上次 log_diagnostics 时的 underrun 计数
    reported_underruns: AtomicU64,
}

impl Engine {
    /// 创建新引擎
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let state = Arc::new(StreamState::new(config.capacity));
        state.set_gain(config.gain);
        if config.lock_memory && !state.lock_memory() {
            log::debug!("Ring buffers not locked, continuing with pageable memory");
        }

        log::debug!(
            "Engine created: {}Hz, {} frames/callback, {} frames/channel",
            config.sample_rate,
            config.frames_per_callback,
            state.capacity()
        );

        Ok(Self {
            format: config.format(),
            config,
            state,
            stats: Arc::new(PlaybackStats::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            stream: None,
            producer_thread: None,
            progress: None,
            last_report: None,
            reported_underruns: AtomicU64::new(0),
        })
    }

    /// 打开设备流并开始播放数据源
    ///
    /// 先启动生产者线程，等缓冲区达到预缓冲目标（或数据源提前耗尽、或超时）
    /// 之后才启动设备流，避免一开始就 underrun。
    pub fn play<B, S>(&mut self, binding: &mut B, source: S) -> Result<(), EngineError>
    where
        B: DeviceBinding + ?Sized,
        S: SampleSource + 'static,
    {
        // 如果正在播放，先停止
        if self.producer_thread.is_some() || self.stream.is_some() {
            self.stop()?;
        }

        self.state.clear();
        self.stats.reset();
        self.reported_underruns.store(0, Ordering::Relaxed);
        self.stop_flag.store(false, Ordering::Release);
        self.last_report = None;

        let sink = RealtimeSink::new(Arc::clone(&self.state)).with_stats(Arc::clone(&self.stats));
        let mut stream = AudioStream::open(binding, self.format, sink)?;

        let producer_config = ProducerConfig {
            drain_stall_timeout: self.config.drain_stall_timeout,
            ..ProducerConfig::default()
        };
        let mut producer = StreamingProducer::new(
            Arc::clone(&self.state),
            self.format,
            Arc::clone(&self.stop_flag),
            producer_config,
        );
        let progress = producer.progress();

        let producer_thread = thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || {
                let mut source = source;
                producer.run(&mut source)
            })
            .map_err(EngineError::Spawn)?;

        self.wait_for_prebuffer(&progress, &producer_thread);

        if let Err(e) = stream.start() {
            // 回调不会运行，生产者不必排空
            progress.abandon();
            if producer_thread.join().is_err() {
                log::error!("Producer thread panicked");
            }
            drop(stream);
            self.state.clear();
            return Err(e.into());
        }

        self.stream = Some(stream);
        self.producer_thread = Some(producer_thread);
        self.progress = Some(progress);
        Ok(())
    }

    fn wait_for_prebuffer(&self, progress: &ProducerProgress, handle: &JoinHandle<ProducerReport>) {
        let target = ((self.state.capacity() as f64 * self.config.prebuffer_ratio) as usize)
            .min(self.state.capacity());
        let started = Instant::now();

        loop {
            let buffered = self.state.frames_readable();
            if buffered >= target || progress.is_push_complete() || handle.is_finished() {
                log::info!(
                    "Prebuffer complete: {} frames in {:?}",
                    buffered,
                    started.elapsed()
                );
                return;
            }
            if started.elapsed() >= self.config.prebuffer_timeout {
                log::warn!(
                    "Prebuffer timed out at {}/{} frames, starting anyway",
                    buffered,
                    target
                );
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// 等待生产者结束（数据源耗尽并排空），然后关闭设备流
    pub fn wait(&mut self) -> Result<ProducerReport, EngineError> {
        if self.producer_thread.is_none() {
            return Err(EngineError::InvalidState("Nothing is playing"));
        }
        self.finish()?;
        self.last_report
            .ok_or(EngineError::InvalidState("Producer did not report"))
    }

    /// 停止播放
    ///
    /// 设置停止标志，生产者停止写入并排空已缓冲的样本后，关闭设备流
    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.stop_flag.store(true, Ordering::Release);
        self.finish()
    }

    /// join 生产者，然后拆除设备流
    ///
    /// 生产者 panic 也会先拆除设备流再返回错误
    fn finish(&mut self) -> Result<(), EngineError> {
        let joined = match self.producer_thread.take() {
            Some(thread) => match thread.join() {
                Ok(report) => {
                    self.last_report = Some(report);
                    Ok(())
                }
                Err(_) => {
                    log::error!("Producer thread panicked");
                    Err(EngineError::ProducerPanicked)
                }
            },
            None => Ok(()),
        };

        let closed = match self.stream.take() {
            Some(mut stream) => {
                let result = stream.close();
                self.log_diagnostics();
                log::info!("Playback stopped");
                log::debug!("{}", self.stats.report());
                result
            }
            None => Ok(()),
        };

        joined?;
        closed.map_err(EngineError::from)
    }

    /// 用于跨线程（例如信号处理）请求停止
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    /// 设置增益，下一帧生效
    pub fn set_gain(&self, gain: f32) {
        self.state.set_gain(gain);
    }

    pub fn gain(&self) -> f32 {
        self.state.gain()
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// 设备流是否正在运行
    pub fn is_active(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_active()).unwrap_or(false)
    }

    /// 生产者是否已结束（数据源耗尽或被停止，且排空完毕）
    pub fn is_finished(&self) -> bool {
        self.progress
            .as_ref()
            .map(|p| p.is_finished())
            .unwrap_or(self.last_report.is_some())
    }

    /// 生产者线程是否还在运行
    ///
    /// 生产者 panic 时 `is_finished` 不会变成 true，轮询时需要同时检查这个
    pub fn is_producer_running(&self) -> bool {
        self.producer_thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 最近一次结束的生产者报告
    pub fn last_report(&self) -> Option<ProducerReport> {
        self.last_report
    }

    /// 获取统计信息
    pub fn stats(&self) -> EngineStats {
        let frames_played = self.stats.frames_played();
        EngineStats {
            buffer_fill_ratio: self.state.left().fill_ratio(),
            frames_buffered: self.state.frames_readable(),
            underrun_count: self.stats.underrun_count(),
            frames_played,
            frames_written: self
                .progress
                .as_ref()
                .map(|p| p.frames_written())
                .unwrap_or(0),
            position_secs: frames_played as f64 / self.format.sample_rate as f64,
        }
    }

    pub fn playback_report(&self) -> StatsReport {
        self.stats.report()
    }

    /// 记录自上次调用以来新增的 underrun
    ///
    /// 回调线程不写日志，由所有者线程定期调用
    pub fn log_diagnostics(&self) {
        let total = self.stats.underrun_count();
        let previous = self.reported_underruns.swap(total, Ordering::Relaxed);
        if total > previous {
            log::warn!(
                "{} underrun(s) since last check ({} total, {} silent frames)",
                total - previous,
                total,
                self.stats.silent_frames()
            );
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.producer_thread.is_some() || self.stream.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Engine teardown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ClockedDevice;
    use crate::source::{Chunk, VecSource};

    /// 第一次拉取就 panic 的数据源
    struct PanickingSource;

    impl SampleSource for PanickingSource {
        fn next_chunk(&mut self) -> Option<Chunk> {
            panic!("source failed");
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            sample_rate: 48_000,
            frames_per_callback: 32,
            capacity: 1024,
            gain: 1.0,
            prebuffer_timeout: Duration::from_millis(200),
            drain_stall_timeout: Duration::from_millis(200),
            lock_memory: false,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.frames_per_callback, 256);
        assert_eq!(config.capacity, 131_072);
        assert_eq!(config.prebuffer_ratio, 0.25);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_small_capacity() {
        let config = EngineConfig {
            capacity: 128,
            frames_per_callback: 256,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_config_rejects_zero_values() {
        for config in [
            EngineConfig { sample_rate: 0, ..EngineConfig::default() },
            EngineConfig { frames_per_callback: 0, ..EngineConfig::default() },
            EngineConfig { prebuffer_ratio: 1.5, ..EngineConfig::default() },
            EngineConfig { prebuffer_ratio: f64::NAN, ..EngineConfig::default() },
        ] {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_buffer_ms() {
        let config = EngineConfig::default().with_buffer_ms(500);
        assert_eq!(config.capacity, 22_050);
    }

    #[test]
    fn test_buffer_ms_saturates() {
        let config = EngineConfig::default().with_buffer_ms(u64::MAX / 1000);
        assert!(config.capacity > EngineConfig::MAX_CAPACITY);
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig::default().with_buffer_ms(u64::MAX);
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_config_rejects_huge_capacity() {
        // 向上取整到 2 的幂会溢出
        let config = EngineConfig {
            capacity: usize::MAX / 2 + 2,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));

        let config = EngineConfig {
            capacity: EngineConfig::MAX_CAPACITY + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));

        let config = EngineConfig {
            capacity: EngineConfig::MAX_CAPACITY,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wait_without_play() {
        let mut engine = Engine::new(test_config()).unwrap();
        assert!(matches!(engine.wait(), Err(EngineError::InvalidState(_))));
        assert!(engine.stop().is_ok());
        assert!(!engine.is_finished());
    }

    #[test]
    fn test_play_finite_source() {
        let mut engine = Engine::new(test_config()).unwrap();
        let mut device = ClockedDevice::new();

        let samples: Vec<f32> = (0..500).map(|i| i as f32 / 500.0).collect();
        engine.play(&mut device, VecSource::from_mono(samples)).unwrap();
        assert!(engine.is_active());

        let report = engine.wait().unwrap();
        assert_eq!(report.outcome, ProducerOutcome::Exhausted);
        assert_eq!(report.frames_written, 500);
        assert!(report.drained);

        assert!(engine.is_finished());
        assert!(!engine.is_active());
        let stats = engine.stats();
        assert_eq!(stats.frames_played, 500);
        assert_eq!(stats.frames_buffered, 0);
    }

    #[test]
    fn test_producer_panic_ends_polling() {
        let mut engine = Engine::new(test_config()).unwrap();
        let mut device = ClockedDevice::new();

        engine.play(&mut device, PanickingSource).unwrap();

        let started = Instant::now();
        while engine.is_producer_running() {
            assert!(started.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!engine.is_finished());

        assert!(matches!(engine.wait(), Err(EngineError::ProducerPanicked)));
        assert!(!engine.is_active());
        assert!(!engine.is_producer_running());
    }

    #[test]
    fn test_gain_passthrough() {
        let engine = Engine::new(test_config()).unwrap();
        assert_eq!(engine.gain(), 1.0);
        engine.set_gain(0.5);
        assert_eq!(engine.gain(), 0.5);
    }
}
