//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: 每声道一个 lock-free SPSC 通道
//! - State: 生产者与回调共享的状态
//! - Sink: 实时回调侧的消费者
//! - Stats: 播放统计
//! - Device: 设备绑定（软件时钟 / cpal）
//! - Output: 对所有者暴露的流状态接口

pub mod device;
pub mod format;
pub mod output;
pub mod ring_buffer;
pub mod sink;
pub mod state;
pub mod stats;

pub use device::{ClockedDevice, DeviceBinding, DeviceError, DeviceStream};
pub use format::StreamFormat;
pub use output::AudioStream;
pub use ring_buffer::RingBuffer;
pub use sink::{RealtimeSink, RenderOutcome};
pub use state::StreamState;
pub use stats::{PlaybackStats, StatsReport};
