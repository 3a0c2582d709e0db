//! 实时回调侧的消费者
//!
//! 设备每次请求音频时调用 [`RealtimeSink::render`]。
//!
//! **绝对禁止：**
//! - 锁
//! - 分配
//! - I/O（包括日志）
//! - 阻塞或重试
//!
//! 数据不足时输出静音，回调本身没有错误类型。

use std::sync::Arc;

use super::state::StreamState;
use super::stats::PlaybackStats;

/// 单次回调的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderOutcome {
    /// 从声道中取出并输出的帧数
    pub frames_played: usize,
    /// 以静音填充的帧数
    pub silent_frames: usize,
}

/// 实时消费者
///
/// 持有 `StreamState` 的一个 `Arc`（设备侧句柄）。
pub struct RealtimeSink {
    state: Arc<StreamState>,
    stats: Option<Arc<PlaybackStats>>,
}

impl RealtimeSink {
    pub fn new(state: Arc<StreamState>) -> Self {
        Self { state, stats: None }
    }

    pub fn with_stats(mut self, stats: Arc<PlaybackStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    /// 填充一个交织立体声输出缓冲区
    ///
    /// 帧数为 `out.len() / 2`。按顺序处理每一帧：两个声道都有样本时各取一个、
    /// 乘以增益后写出；任一声道为空时，本次回调剩余的帧全部写静音。
    /// 增益每帧读取一次，两个声道共用，修改从下一帧起生效。
    /// 耗时只与帧数成正比。
    #[inline]
    pub fn render(&mut self, out: &mut [f32]) -> RenderOutcome {
        if let Some(stats) = &self.stats {
            stats.on_callback(&self.state);
        }

        let frames = out.len() / 2;
        let left = self.state.left();
        let right = self.state.right();

        // 只有本线程会 pop，可读数量在回调期间只增不减
        let available = frames.min(self.state.frames_readable());

        let (playable, rest) = out.split_at_mut(available * 2);
        let mut played = 0;
        for frame in playable.chunks_exact_mut(2) {
            match (left.pop(), right.pop()) {
                (Some(l), Some(r)) => {
                    let gain = self.state.gain();
                    frame[0] = l * gain;
                    frame[1] = r * gain;
                    played += 1;
                }
                _ => {
                    frame[0] = 0.0;
                    frame[1] = 0.0;
                }
            }
        }
        rest.fill(0.0);

        if played > 0 {
            self.state.mark_ready();
        }

        let outcome = RenderOutcome {
            frames_played: played,
            silent_frames: frames - played,
        };

        if let Some(stats) = &self.stats {
            stats.record_render(outcome.frames_played, outcome.silent_frames);
        }

        outcome
    }
}
