//! 回调线程零分配
//!
//! 单独的测试二进制，安装审计分配器作为全局分配器。

use std::time::Duration;

use tonestream::alloc::{realtime_allocations, RealtimeAuditAllocator};
use tonestream::audio::ClockedDevice;
use tonestream::engine::{Engine, EngineConfig};
use tonestream::source::{Note, NoteSequence, SPACE_ODYSSEY};

#[global_allocator]
static ALLOC: RealtimeAuditAllocator = RealtimeAuditAllocator;

#[test]
fn test_callback_thread_does_not_allocate() {
    let config = EngineConfig {
        sample_rate: 8_000,
        frames_per_callback: 64,
        capacity: 2048,
        gain: 0.5,
        prebuffer_timeout: Duration::from_millis(200),
        lock_memory: false,
        ..EngineConfig::default()
    };

    let mut device = ClockedDevice::with_capture(512);
    let mut engine = Engine::new(config).unwrap();

    // 缩短到约 0.2 秒；排空阶段的尾部回调覆盖静音路径
    let notes: Vec<Note> = SPACE_ODYSSEY
        .iter()
        .map(|n| Note::new(n.id, n.duration_ms / 40))
        .collect();
    let source = NoteSequence::new(notes, 8_000).with_pitch_scale(0.5);

    engine.play(&mut device, source).unwrap();
    let report = engine.wait().unwrap();

    assert!(report.frames_written > 0);
    assert!(engine.stats().frames_played > 0);
    assert_eq!(realtime_allocations(), 0);
}
