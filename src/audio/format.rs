//! 流格式
//!
//! 管线是固定的：双声道、f32、固定采样率、每次回调固定帧数。

use std::time::Duration;

/// 固定声道数（左、右）
pub const CHANNELS: u16 = 2;

/// 样本格式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleFormat {
    /// 32-bit 浮点，交织输出 LRLR...
    #[default]
    F32,
}

/// 流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_callback: u32,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, frames_per_callback: u32) -> Self {
        Self {
            sample_rate,
            channels: CHANNELS,
            frames_per_callback,
            sample_format: SampleFormat::F32,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 单次回调需要的交织样本数
    #[inline]
    pub fn samples_per_callback(&self) -> usize {
        self.frames_per_callback as usize * self.samples_per_frame()
    }

    /// 回调周期 = frames_per_callback / sample_rate
    pub fn callback_period(&self) -> Duration {
        self.frames_to_duration(self.frames_per_callback as usize)
    }

    /// 单声道样本数（= 帧数）按名义采样率换算成时长
    pub fn frames_to_duration(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(44_100, 256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_period() {
        let format = StreamFormat::new(48_000, 480);
        assert_eq!(format.callback_period(), Duration::from_millis(10));
        assert_eq!(format.samples_per_callback(), 960);
    }

    #[test]
    fn test_frames_to_duration() {
        let format = StreamFormat::new(44_100, 256);
        assert_eq!(format.frames_to_duration(44_100), Duration::from_secs(1));
        assert_eq!(format.frames_to_duration(0), Duration::ZERO);
    }

    #[test]
    fn test_zero_rate_is_zero_duration() {
        let format = StreamFormat::new(0, 256);
        assert_eq!(format.callback_period(), Duration::ZERO);
    }
}
