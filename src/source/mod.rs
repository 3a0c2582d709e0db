//! 生产者数据源
//!
//! 数据源是惰性的、可能无限的样本块序列，只能通过重新构造来重新开始。
//! 生产者按需拉取块，从不修改它们。

pub mod synth;

pub use synth::{Note, NoteId, NoteSequence, ToneSource, Waveform, SPACE_ODYSSEY};

/// 一个立体声样本块
///
/// 左右声道长度总是相等，保证写入后帧对齐。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl Chunk {
    /// 单声道块，左右声道内容相同
    pub fn mono(samples: Vec<f32>) -> Self {
        Self {
            right: samples.clone(),
            left: samples,
        }
    }

    /// 立体声块，较长的一侧被截断到较短的一侧
    pub fn stereo(mut left: Vec<f32>, mut right: Vec<f32>) -> Self {
        if left.len() != right.len() {
            log::debug!(
                "Truncating unaligned chunk: left {} / right {} samples",
                left.len(),
                right.len()
            );
            let frames = left.len().min(right.len());
            left.truncate(frames);
            right.truncate(frames);
        }
        Self { left, right }
    }

    pub fn left(&self) -> &[f32] {
        &self.left
    }

    pub fn right(&self) -> &[f32] {
        &self.right
    }

    pub fn frames(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }
}

/// 生产者数据源接口
pub trait SampleSource: Send {
    /// 取下一块；`None` 表示数据源已耗尽
    fn next_chunk(&mut self) -> Option<Chunk>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn next_chunk(&mut self) -> Option<Chunk> {
        (**self).next_chunk()
    }
}

/// 有限的块列表
pub struct VecSource {
    chunks: std::vec::IntoIter<Chunk>,
}

impl VecSource {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter(),
        }
    }

    /// 单个单声道块
    pub fn from_mono(samples: Vec<f32>) -> Self {
        Self::new(vec![Chunk::mono(samples)])
    }
}

impl SampleSource for VecSource {
    fn next_chunk(&mut self) -> Option<Chunk> {
        self.chunks.next()
    }
}

/// 任意迭代器作为数据源
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Chunk> + Send,
{
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I> SampleSource for IterSource<I>
where
    I: Iterator<Item = Chunk> + Send,
{
    fn next_chunk(&mut self) -> Option<Chunk> {
        self.iter.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_duplicates() {
        let chunk = Chunk::mono(vec![0.1, 0.2]);
        assert_eq!(chunk.left(), &[0.1, 0.2]);
        assert_eq!(chunk.right(), &[0.1, 0.2]);
        assert_eq!(chunk.frames(), 2);
    }

    #[test]
    fn test_stereo_truncates_to_shorter() {
        let chunk = Chunk::stereo(vec![1.0, 2.0, 3.0], vec![-1.0]);
        assert_eq!(chunk.left(), &[1.0]);
        assert_eq!(chunk.right(), &[-1.0]);
    }

    #[test]
    fn test_vec_source_exhausts() {
        let mut source = VecSource::new(vec![Chunk::mono(vec![1.0]), Chunk::mono(vec![2.0])]);
        assert_eq!(source.next_chunk().unwrap().left(), &[1.0]);
        assert_eq!(source.next_chunk().unwrap().left(), &[2.0]);
        assert!(source.next_chunk().is_none());
        assert!(source.next_chunk().is_none());
    }

    #[test]
    fn test_iter_source_is_lazy() {
        let mut pulled = 0;
        let mut source = IterSource::new(
            (0..).map(|i| Chunk::mono(vec![i as f32])),
        );
        for _ in 0..3 {
            pulled += source.next_chunk().map(|c| c.frames()).unwrap_or(0);
        }
        assert_eq!(pulled, 3);
    }

    #[test]
    fn test_boxed_source() {
        let mut source: Box<dyn SampleSource> = Box::new(VecSource::from_mono(vec![0.5]));
        assert_eq!(source.next_chunk().unwrap().frames(), 1);
        assert!(source.next_chunk().is_none());
    }
}
