//! Lock-free Single-Producer Single-Consumer Ring Buffer
//!
//! 每个输出声道一个实例（左、右），生产线程写入，实时回调读取。
//!
//! 设计目标：
//! - 零锁：push/pop 都是 wait-free 的
//! - 零分配：所有内存在初始化时预分配，之后不再改变容量
//! - 缓存友好：读写游标各自独占一个 cache line
//!
//! 失败不是错误：`push` 失败表示满（背压），`pop` 返回 `None` 表示空（underrun）。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cache line 对齐包装器
#[repr(align(64))]
pub struct CacheLine<T>(pub T);

impl<T> CacheLine<T> {
    pub fn new(val: T) -> Self {
        Self(val)
    }
}

impl<T: Default> Default for CacheLine<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

/// SPSC 无锁环形缓冲区
///
/// 游标单调递增（wrapping），下标通过 `& mask` 回绕，因此容量必须是 2 的幂。
/// 不变量：`read_available() + write_available() == capacity()`。
pub struct RingBuffer<T: Copy + Default> {
    buffer: Box<[UnsafeCell<T>]>,
    capacity: usize,
    mask: usize,

    write_pos: CacheLine<AtomicUsize>,
    read_pos: CacheLine<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl<T: Copy + Default + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// 创建指定容量的 Ring Buffer
    ///
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let buffer: Vec<UnsafeCell<T>> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CacheLine::new(AtomicUsize::new(0)),
            read_pos: CacheLine::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 创建指定最小容量的 Ring Buffer（自动向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    /// 写入单个样本（生产者调用）
    ///
    /// 满时返回 false，不修改任何状态
    #[inline]
    pub fn push(&self, value: T) -> bool {
        let write = self.write_pos.0.load(Ordering::Relaxed);
        let read = self.read_pos.0.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= self.capacity {
            return false;
        }

        unsafe {
            *self.buffer[write & self.mask].get() = value;
        }
        self.write_pos.0.store(write.wrapping_add(1), Ordering::Release);
        true
    }

    /// 取出最旧的样本（消费者调用）
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let read = self.read_pos.0.load(Ordering::Relaxed);
        let write = self.write_pos.0.load(Ordering::Acquire);

        if write == read {
            return None;
        }

        let value = unsafe { *self.buffer[read & self.mask].get() };
        self.read_pos.0.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// 批量写入（生产者调用）
    ///
    /// 返回实际写入的样本数，wait-free
    #[inline]
    pub fn write(&self, data: &[T]) -> usize {
        let write = self.write_pos.0.load(Ordering::Relaxed);
        let read = self.read_pos.0.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let to_write = data.len().min(self.capacity - used);

        for (i, &sample) in data[..to_write].iter().enumerate() {
            let idx = write.wrapping_add(i) & self.mask;
            unsafe {
                *self.buffer[idx].get() = sample;
            }
        }

        self.write_pos.0.store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// 批量读取（消费者调用）
    ///
    /// 返回实际读取的样本数，wait-free
    #[inline]
    pub fn read(&self, output: &mut [T]) -> usize {
        let read = self.read_pos.0.load(Ordering::Relaxed);
        let write = self.write_pos.0.load(Ordering::Acquire);

        let to_read = output.len().min(write.wrapping_sub(read));

        for (i, slot) in output[..to_read].iter_mut().enumerate() {
            let idx = read.wrapping_add(i) & self.mask;
            *slot = unsafe { *self.buffer[idx].get() };
        }

        self.read_pos.0.store(read.wrapping_add(to_read), Ordering::Release);
        to_read
    }

    /// 当前可读样本数
    #[inline]
    pub fn read_available(&self) -> usize {
        let write = self.write_pos.0.load(Ordering::Acquire);
        let read = self.read_pos.0.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 当前可写空间
    #[inline]
    pub fn write_available(&self) -> usize {
        self.capacity - self.read_available()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 缓冲区填充比例（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.read_available() as f64 / self.capacity as f64
    }

    /// 清空缓冲区
    ///
    /// 只能在两端都空闲时由所有者调用
    pub fn clear(&self) {
        let write = self.write_pos.0.load(Ordering::Acquire);
        self.read_pos.0.store(write, Ordering::Release);
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 回调线程上的 page fault 会造成严重的时序抖动。返回是否成功锁定。
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.buffer.as_ptr() as *const libc::c_void;
        let len = self.capacity * std::mem::size_of::<UnsafeCell<T>>();

        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        {
            let ptr = self.buffer.as_ptr() as *const libc::c_void;
            let len = self.capacity * std::mem::size_of::<UnsafeCell<T>>();
            unsafe {
                libc::munlock(ptr, len);
            }
        }

        log::debug!("Ring buffer memory unlocked");
    }

    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }
}

impl<T: Copy + Default> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
