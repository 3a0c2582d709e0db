//! 播放统计模块
//!
//! 在音频回调中收集统计信息，采用降频采样策略减少开销。
//! 回调只做 relaxed 原子操作，日志由所有者线程根据计数差值输出。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::state::StreamState;

/// 统计采样间隔：每 N 次 callback 才采样一次水位
const SAMPLE_INTERVAL: u64 = 16;

/// 水位历史大小
const WATER_LEVEL_BUFFER_SIZE: usize = 256;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
pub struct PlaybackStats {
    callback_count: AtomicU64,

    water_level_buffer: Box<[AtomicUsize; WATER_LEVEL_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,
    frames_played: AtomicU64,
    silent_frames: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            silent_frames: AtomicU64::new(0),
        }
    }

    /// 在 render callback 内调用
    ///
    /// 只在采样点才读水位
    #[inline]
    pub fn on_callback(&self, state: &StreamState) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let water_level = state.frames_readable();
            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % WATER_LEVEL_BUFFER_SIZE;
            self.water_level_buffer[idx].store(water_level, Ordering::Relaxed);
        }
    }

    /// 记录一次回调的结果
    #[inline]
    pub fn record_render(&self, frames_played: usize, silent_frames: usize) {
        self.frames_played
            .fetch_add(frames_played as u64, Ordering::Relaxed);
        if silent_frames > 0 {
            self.silent_frames
                .fetch_add(silent_frames as u64, Ordering::Relaxed);
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn silent_frames(&self) -> u64 {
        self.silent_frames.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self) -> StatsReport {
        let sampled = self
            .water_level_write_idx
            .load(Ordering::Relaxed)
            .min(WATER_LEVEL_BUFFER_SIZE);

        let water_stats = if sampled == 0 {
            WaterLevelStats { min: 0, max: 0 }
        } else {
            let levels = self.water_level_buffer[..sampled]
                .iter()
                .map(|l| l.load(Ordering::Relaxed));
            let (min, max) = levels.fold((usize::MAX, 0), |(min, max), l| {
                (min.min(l), max.max(l))
            });
            WaterLevelStats { min, max }
        };

        StatsReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            water_stats,
            underrun_count: self.underrun_count(),
            frames_played: self.frames_played(),
            silent_frames: self.silent_frames(),
        }
    }

    /// 重置统计
    ///
    /// 仅在回调停止时调用
    pub fn reset(&self) {
        self.callback_count.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.frames_played.store(0, Ordering::Relaxed);
        self.silent_frames.store(0, Ordering::Relaxed);

        for level in self.water_level_buffer.iter() {
            level.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub frames_played: u64,
    pub silent_frames: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(
            f,
            "Water level sampled every {} callbacks",
            self.sample_interval
        )?;
        writeln!(f, "  Min: {} frames", self.water_stats.min)?;
        writeln!(f, "  Max: {} frames", self.water_stats.max)?;
        writeln!(f)?;
        writeln!(f, "Frames played: {}", self.frames_played)?;
        writeln!(f, "Silent frames: {}", self.silent_frames)?;
        writeln!(f, "Underruns: {}", self.underrun_count)?;

        Ok(())
    }
}
