use std::time::Duration;

use crate::buffering::frame::{AudioClip, Frame};

/// One contiguous spoken segment.
///
/// Always non-empty, with strictly increasing frame `seq`. Only the
/// [`UtteranceAssembler`](super::UtteranceAssembler) builds these; the
/// pipeline takes them by value.
#[derive(Debug)]
pub struct Utterance {
    frames: Vec<Frame>,
}

impl Utterance {
    /// Returns `None` for an empty buffer or out-of-order frames.
    pub fn from_frames(frames: Vec<Frame>) -> Option<Self> {
        if frames.is_empty() {
            return None;
        }
        let ordered = frames.windows(2).all(|w| w[0].seq < w[1].seq);
        ordered.then_some(Self { frames })
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Never true for an assembled utterance; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn first_seq(&self) -> u64 {
        self.frames.first().map(|f| f.seq).unwrap_or_default()
    }

    pub fn last_seq(&self) -> u64 {
        self.frames.last().map(|f| f.seq).unwrap_or_default()
    }

    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(|f| f.samples.len()).sum()
    }

    pub fn duration(&self) -> Duration {
        self.frames.iter().map(Frame::duration).sum()
    }

    /// Contiguous audio for the transcription service.
    pub fn to_clip(&self) -> AudioClip {
        AudioClip::from_frames(&self.frames)
    }

    /// Append a later utterance, keeping only frames newer than our tail so
    /// the sequence stays strictly increasing.
    pub fn extend(&mut self, later: Utterance) {
        let tail = self.last_seq();
        self.frames
            .extend(later.frames.into_iter().filter(|f| f.seq > tail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(range: std::ops::Range<u64>) -> Vec<Frame> {
        range.map(|seq| Frame::new(seq, vec![0.1; 480], 16_000)).collect()
    }

    #[test]
    fn rejects_empty_and_unordered_frames() {
        assert!(Utterance::from_frames(Vec::new()).is_none());
        let mut unordered = frames(0..3);
        unordered.swap(0, 2);
        assert!(Utterance::from_frames(unordered).is_none());
    }

    #[test]
    fn extend_appends_in_order() {
        let mut first = Utterance::from_frames(frames(0..5)).unwrap();
        let second = Utterance::from_frames(frames(10..13)).unwrap();
        first.extend(second);
        assert_eq!(first.len(), 8);
        assert_eq!(first.first_seq(), 0);
        assert_eq!(first.last_seq(), 12);
        assert!(first.frames().windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn extend_skips_overlapping_frames() {
        let mut first = Utterance::from_frames(frames(0..5)).unwrap();
        let overlapping = Utterance::from_frames(frames(3..8)).unwrap();
        first.extend(overlapping);
        assert_eq!(first.len(), 8);
        assert_eq!(first.last_seq(), 7);
    }

    #[test]
    fn clip_covers_all_samples() {
        let utt = Utterance::from_frames(frames(0..4)).unwrap();
        assert_eq!(utt.sample_count(), 4 * 480);
        assert_eq!(utt.to_clip().samples.len(), 4 * 480);
        assert_eq!(utt.duration(), Duration::from_millis(120));
    }
}
