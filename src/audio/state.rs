//! 生产者与回调共享的流状态
//!
//! 两个声道的 Ring Buffer、一个建议性的 ready 标志和一个增益系数。
//! 由生产者句柄和设备回调各持有一个 `Arc`，生命周期长于两者。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::ring_buffer::RingBuffer;

/// 共享流状态
///
/// ready 和 gain 是两端都会修改、对端也会读取的唯一两个值，都是原子的；
/// 样本数据只由各自声道唯一的写者修改。
pub struct StreamState {
    left: RingBuffer<f32>,
    right: RingBuffer<f32>,
    ready: AtomicBool,
    /// f32 的位模式
    gain: AtomicU32,
}

impl StreamState {
    /// 创建共享状态，每个声道容量至少为 `capacity`（向上取整到 2 的幂）
    pub fn new(capacity: usize) -> Self {
        Self {
            left: RingBuffer::with_min_capacity(capacity),
            right: RingBuffer::with_min_capacity(capacity),
            ready: AtomicBool::new(true),
            gain: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    #[inline]
    pub fn left(&self) -> &RingBuffer<f32> {
        &self.left
    }

    #[inline]
    pub fn right(&self) -> &RingBuffer<f32> {
        &self.right
    }

    /// 单声道容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.left.capacity()
    }

    /// 两个声道都能读出的帧数
    #[inline]
    pub fn frames_readable(&self) -> usize {
        self.left.read_available().min(self.right.read_available())
    }

    /// 两个声道都能写入的帧数
    #[inline]
    pub fn frames_writable(&self) -> usize {
        self.left.write_available().min(self.right.write_available())
    }

    /// 两个声道中剩余最多的未读样本数
    #[inline]
    pub fn samples_pending(&self) -> usize {
        self.left.read_available().max(self.right.read_available())
    }

    /// ready 只是提示：丢失一次更新只会推迟生产者的决定，不会损坏数据
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// 生产者侧更新 ready 标志
    ///
    /// 只尝试一次 CAS。对端并发修改导致的失败直接忽略。
    /// 返回标志当前是否等于 `ready`。
    pub fn update_ready(&self, ready: bool) -> bool {
        let current = self.ready.load(Ordering::Acquire);
        if current == ready {
            return true;
        }
        self.ready
            .compare_exchange_weak(current, ready, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 回调侧：消费过数据后空间已释放，false → true
    ///
    /// 单次 CAS，wait-free
    #[inline]
    pub fn mark_ready(&self) {
        let _ = self
            .ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed);
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    /// 设置增益，下一帧生效
    ///
    /// 非有限值按 0.0 处理，负数截断到 0.0
    pub fn set_gain(&self, gain: f32) {
        let gain = if gain.is_finite() {
            gain.max(0.0)
        } else {
            log::warn!("Ignoring non-finite gain {}, muting", gain);
            0.0
        };
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// 锁定两个声道的内存
    pub fn lock_memory(&self) -> bool {
        let left = self.left.lock_memory();
        let right = self.right.lock_memory();
        left && right
    }

    /// 清空两个声道并复位 ready
    ///
    /// 只能在生产者和回调都停止后调用
    pub fn clear(&self) {
        self.left.clear();
        self.right.clear();
        self.ready.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounded_up() {
        let state = StreamState::new(100);
        assert_eq!(state.capacity(), 128);
        assert_eq!(state.right().capacity(), 128);
    }

    #[test]
    fn test_frame_counts_use_slower_channel() {
        let state = StreamState::new(4);
        state.left().write(&[0.1, 0.2, 0.3]);
        state.right().write(&[0.1]);

        assert_eq!(state.frames_readable(), 1);
        assert_eq!(state.frames_writable(), 1);
        assert_eq!(state.samples_pending(), 3);
    }

    #[test]
    fn test_gain_roundtrip_and_sanitizing() {
        let state = StreamState::new(4);
        assert_eq!(state.gain(), 1.0);

        state.set_gain(0.25);
        assert_eq!(state.gain(), 0.25);

        state.set_gain(-2.0);
        assert_eq!(state.gain(), 0.0);

        state.set_gain(f32::NAN);
        assert_eq!(state.gain(), 0.0);
    }

    #[test]
    fn test_ready_updates() {
        let state = StreamState::new(4);
        assert!(state.is_ready());

        // compare_exchange_weak 允许伪失败，重试直到成功
        while !state.update_ready(false) {}
        assert!(!state.is_ready());

        state.mark_ready();
        assert!(state.is_ready());

        // 已经是目标值时直接返回 true
        assert!(state.update_ready(true));
    }

    #[test]
    fn test_clear_resets() {
        let state = StreamState::new(4);
        state.left().write(&[1.0, 1.0]);
        state.right().write(&[1.0]);
        while !state.update_ready(false) {}

        state.clear();
        assert_eq!(state.samples_pending(), 0);
        assert!(state.is_ready());
    }
}
