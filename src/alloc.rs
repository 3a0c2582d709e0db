//! 实时线程分配审计器
//!
//! 回调线程上任何一次堆分配都可能引起不可预期的延迟。
//! 此分配器透明地转发到 System，同时统计被标记为实时的线程上发生的分配次数，
//! 用来验证回调路径确实零分配。
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: tonestream::alloc::RealtimeAuditAllocator =
//!     tonestream::alloc::RealtimeAuditAllocator;
//! ```

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// 实时线程上的分配次数
static REALTIME_ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

// 使用 `const { }` 初始化确保 TLS 访问不触发堆分配（避免递归）
thread_local! {
    static IS_REALTIME_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// 分配审计器
///
/// - **实时线程（标记后）**: 分配计数 + 转发到 System
/// - **其他线程**: 直接转发到 System
pub struct RealtimeAuditAllocator;

unsafe impl GlobalAlloc for RealtimeAuditAllocator {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record_if_realtime();
        unsafe { System.alloc(layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record_if_realtime();
        unsafe { System.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record_if_realtime();
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[inline]
fn record_if_realtime() {
    if is_realtime_thread() {
        REALTIME_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    }
}

/// 标记当前线程为实时线程
pub fn mark_realtime_thread() {
    IS_REALTIME_THREAD.with(|f| f.set(true));
}

/// 取消当前线程的实时标记
pub fn unmark_realtime_thread() {
    IS_REALTIME_THREAD.with(|f| f.set(false));
}

/// 检查当前线程是否为实时线程
///
/// TLS 已销毁时按非实时处理
#[inline]
pub fn is_realtime_thread() -> bool {
    IS_REALTIME_THREAD.try_with(|f| f.get()).unwrap_or(false)
}

/// 迄今为止实时线程上发生的分配次数
///
/// 只有安装了 [`RealtimeAuditAllocator`] 作为全局分配器时才有意义
pub fn realtime_allocations() -> u64 {
    REALTIME_ALLOCATIONS.load(Ordering::Relaxed)
}
