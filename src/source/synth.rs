//! 波形合成
//!
//! 音符表、方波/正弦波生成，以及两个数据源：
//! - [`NoteSequence`]：有限旋律，每个音符一块
//! - [`ToneSource`]：相位连续的单音，可无限

use std::f32::consts::TAU;

use super::{Chunk, SampleSource};

/// 音符
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NoteId {
    C1,
    G1,
    C2,
    E2,
    Eb2,
}

impl NoteId {
    /// 频率（Hz）
    pub fn frequency(self) -> f32 {
        match self {
            Self::C1 => 523.25,
            Self::G1 => 783.99,
            Self::C2 => 1046.50,
            Self::E2 => 1318.51,
            Self::Eb2 => 1244.51,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Note {
    pub id: NoteId,
    pub duration_ms: i64,
}

impl Note {
    pub const fn new(id: NoteId, duration_ms: i64) -> Self {
        Self { id, duration_ms }
    }
}

/// 《查拉图斯特拉如是说》开头
pub const SPACE_ODYSSEY: [Note; 5] = [
    Note::new(NoteId::C1, 1500),
    Note::new(NoteId::G1, 1500),
    Note::new(NoteId::C2, 1500),
    Note::new(NoteId::E2, 600),
    Note::new(NoteId::Eb2, 1200),
];

/// 波形
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Waveform {
    #[default]
    Square,
    Sine,
}

/// 相位累加振荡器，相位范围 [0, 1)
#[derive(Clone, Copy, Debug)]
struct Oscillator {
    waveform: Waveform,
    phase: f32,
    step: f32,
}

impl Oscillator {
    fn new(waveform: Waveform, freq: f32, sample_rate: u32) -> Self {
        Self {
            waveform,
            phase: 0.0,
            step: freq / sample_rate as f32,
        }
    }

    #[inline]
    fn next_sample(&mut self) -> f32 {
        let value = match self.waveform {
            Waveform::Square => {
                if self.phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sine => (self.phase * TAU).sin(),
        };
        self.phase = (self.phase + self.step).fract();
        value
    }

    fn fill(&mut self, out: &mut Vec<f32>, count: usize) {
        out.reserve(count);
        for _ in 0..count {
            out.push(self.next_sample());
        }
    }
}

fn is_valid_tone(freq: f32, sample_rate: u32) -> bool {
    freq.is_finite() && freq > 0.0 && sample_rate > 0
}

/// 毫秒时长对应的样本数（向上取整），非正时长为 0
///
/// 超大时长饱和到 `usize::MAX`
pub fn samples_for_duration(duration_ms: i64, sample_rate: u32) -> usize {
    if duration_ms <= 0 {
        return 0;
    }
    let samples = (duration_ms as u64)
        .saturating_mul(sample_rate as u64)
        .div_ceil(1000);
    usize::try_from(samples).unwrap_or(usize::MAX)
}

/// 生成一段波形
///
/// 频率或时长为零、负数（或频率非有限）时返回空序列，不是错误
pub fn generate(waveform: Waveform, freq: f32, duration_ms: i64, sample_rate: u32) -> Vec<f32> {
    if !is_valid_tone(freq, sample_rate) {
        return Vec::new();
    }

    let count = samples_for_duration(duration_ms, sample_rate);
    let mut samples = Vec::new();
    Oscillator::new(waveform, freq, sample_rate).fill(&mut samples, count);
    samples
}

/// 有限旋律
///
/// 每次拉取生成下一个音符的单声道块，生成结果为空的音符被跳过
pub struct NoteSequence {
    notes: Vec<Note>,
    next: usize,
    sample_rate: u32,
    waveform: Waveform,
    pitch_scale: f32,
}

impl NoteSequence {
    pub fn new(notes: impl Into<Vec<Note>>, sample_rate: u32) -> Self {
        Self {
            notes: notes.into(),
            next: 0,
            sample_rate,
            waveform: Waveform::Square,
            pitch_scale: 1.0,
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    /// 所有音符频率乘以 `scale`（0.5 = 低八度）
    pub fn with_pitch_scale(mut self, scale: f32) -> Self {
        self.pitch_scale = scale;
        self
    }

    /// 全部音符的总帧数
    pub fn total_frames(&self) -> usize {
        self.notes
            .iter()
            .filter(|n| is_valid_tone(n.id.frequency() * self.pitch_scale, self.sample_rate))
            .map(|n| samples_for_duration(n.duration_ms, self.sample_rate))
            .sum()
    }
}

impl SampleSource for NoteSequence {
    fn next_chunk(&mut self) -> Option<Chunk> {
        while let Some(note) = self.notes.get(self.next).copied() {
            self.next += 1;
            let freq = note.id.frequency() * self.pitch_scale;
            let wave = generate(self.waveform, freq, note.duration_ms, self.sample_rate);
            if !wave.is_empty() {
                log::debug!("Note {:?}: {:.2}Hz, {} samples", note.id, freq, wave.len());
                return Some(Chunk::mono(wave));
            }
        }
        None
    }
}

/// 相位连续的单音
///
/// 默认无限；`with_duration_ms` 之后有限
pub struct ToneSource {
    oscillator: Oscillator,
    chunk_frames: usize,
    remaining: Option<usize>,
}

impl ToneSource {
    /// 默认块大小（帧）
    pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

    pub fn new(waveform: Waveform, freq: f32, sample_rate: u32) -> Self {
        let remaining = if is_valid_tone(freq, sample_rate) {
            None
        } else {
            Some(0)
        };
        Self {
            oscillator: Oscillator::new(waveform, freq, sample_rate.max(1)),
            chunk_frames: Self::DEFAULT_CHUNK_FRAMES,
            remaining,
        }
    }

    pub fn with_chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames.max(1);
        self
    }

    /// 限制总时长，对无效的音调不起作用
    pub fn with_duration_ms(mut self, duration_ms: i64, sample_rate: u32) -> Self {
        if self.remaining != Some(0) {
            self.remaining = Some(samples_for_duration(duration_ms, sample_rate));
        }
        self
    }
}

impl SampleSource for ToneSource {
    fn next_chunk(&mut self) -> Option<Chunk> {
        let frames = match self.remaining {
            Some(0) => return None,
            Some(remaining) => remaining.min(self.chunk_frames),
            None => self.chunk_frames,
        };
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= frames;
        }

        let mut samples = Vec::new();
        self.oscillator.fill(&mut samples, frames);
        Some(Chunk::mono(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_table() {
        assert_eq!(NoteId::C1.frequency(), 523.25);
        assert_eq!(NoteId::Eb2.frequency(), 1244.51);
        assert_eq!(SPACE_ODYSSEY.len(), 5);
        assert_eq!(SPACE_ODYSSEY[3], Note::new(NoteId::E2, 600));
    }

    #[test]
    fn test_generate_length() {
        // 44.1 samples/ms，向上取整
        assert_eq!(generate(Waveform::Square, 440.0, 10, 44_100).len(), 441);
        assert_eq!(generate(Waveform::Sine, 440.0, 1, 44_100).len(), 45);
    }

    #[test]
    fn test_generate_invalid_yields_nothing() {
        assert!(generate(Waveform::Square, 0.0, 100, 44_100).is_empty());
        assert!(generate(Waveform::Square, -440.0, 100, 44_100).is_empty());
        assert!(generate(Waveform::Square, f32::NAN, 100, 44_100).is_empty());
        assert!(generate(Waveform::Square, 440.0, 0, 44_100).is_empty());
        assert!(generate(Waveform::Square, 440.0, -5, 44_100).is_empty());
    }

    #[test]
    fn test_square_wave_shape() {
        // 1kHz @ 8kHz：每半周期 4 个样本
        let wave = generate(Waveform::Square, 1000.0, 1, 8000);
        assert_eq!(wave, vec![1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_sine_bounded() {
        let wave = generate(Waveform::Sine, 440.0, 50, 44_100);
        assert_eq!(wave[0], 0.0);
        assert!(wave.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_note_sequence_chunks() {
        let notes = [
            Note::new(NoteId::C1, 10),
            Note::new(NoteId::G1, 0),
            Note::new(NoteId::C2, 20),
        ];
        let mut seq = NoteSequence::new(notes, 1000).with_pitch_scale(0.5);
        assert_eq!(seq.total_frames(), 30);

        assert_eq!(seq.next_chunk().unwrap().frames(), 10);
        // 零时长的音符被跳过
        assert_eq!(seq.next_chunk().unwrap().frames(), 20);
        assert!(seq.next_chunk().is_none());
    }

    #[test]
    fn test_tone_source_finite() {
        let mut tone = ToneSource::new(Waveform::Square, 100.0, 1000)
            .with_chunk_frames(4)
            .with_duration_ms(10, 1000);

        let frames: Vec<usize> = std::iter::from_fn(|| tone.next_chunk().map(|c| c.frames())).collect();
        assert_eq!(frames, vec![4, 4, 2]);
    }

    #[test]
    fn test_huge_duration_saturates() {
        let samples = samples_for_duration(i64::MAX, 44_100);
        assert!(samples > 0);
        assert!(samples >= samples_for_duration(i64::MAX / 10, 44_100));

        // 近似无限的单音，照常按块输出
        let mut tone = ToneSource::new(Waveform::Sine, 440.0, 44_100)
            .with_chunk_frames(16)
            .with_duration_ms(i64::MAX / 10, 44_100);
        assert_eq!(tone.next_chunk().unwrap().frames(), 16);
        assert_eq!(tone.next_chunk().unwrap().frames(), 16);
    }

    #[test]
    fn test_tone_source_phase_continuous() {
        // 1kHz @ 8kHz，块边界不打断波形
        let mut tone = ToneSource::new(Waveform::Square, 1000.0, 8000).with_chunk_frames(3);
        let mut samples = Vec::new();
        for _ in 0..3 {
            samples.extend_from_slice(tone.next_chunk().unwrap().left());
        }
        assert_eq!(samples[..8], [1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_tone_source_invalid_is_empty() {
        let mut tone = ToneSource::new(Waveform::Sine, 0.0, 44_100);
        assert!(tone.next_chunk().is_none());

        let mut tone = ToneSource::new(Waveform::Sine, 440.0, 44_100).with_duration_ms(-1, 44_100);
        assert!(tone.next_chunk().is_none());
    }
}
