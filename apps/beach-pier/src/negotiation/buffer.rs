use std::collections::VecDeque;

/// Outcome of handing a remote candidate to the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// Held until the remote description is applied.
    Buffered,
    /// The buffer was already flushed; apply the candidate now.
    Ready(T),
}

/// Holds remote candidates that arrive before the remote description.
///
/// Candidates leave the buffer exactly once: either in the single [`flush`](Self::flush)
/// or straight back from [`push`](Self::push) once the buffer has been flushed.
#[derive(Debug)]
pub struct CandidateBuffer<T> {
    pending: VecDeque<T>,
    flushed: bool,
}

impl<T> Default for CandidateBuffer<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            flushed: false,
        }
    }
}

impl<T> CandidateBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: T) -> Admission<T> {
        if self.flushed {
            Admission::Ready(candidate)
        } else {
            self.pending.push_back(candidate);
            Admission::Buffered
        }
    }

    /// Drains everything buffered so far in arrival order.
    ///
    /// Later calls return nothing.
    pub fn flush(&mut self) -> Vec<T> {
        self.flushed = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn buffers_until_flushed_then_passes_through() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.push(1), Admission::Buffered);
        assert_eq!(buffer.push(2), Admission::Buffered);
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_flushed());

        assert_eq!(buffer.flush(), vec![1, 2]);
        assert!(buffer.is_empty());
        assert!(buffer.is_flushed());

        assert_eq!(buffer.push(3), Admission::Ready(3));
        assert!(buffer.is_empty());
    }

    #[test_timeout::timeout]
    fn second_flush_yields_nothing() {
        let mut buffer = CandidateBuffer::new();
        buffer.push("a");
        assert_eq!(buffer.flush(), vec!["a"]);
        assert!(buffer.flush().is_empty());
    }

    #[test_timeout::timeout]
    fn every_split_point_releases_each_candidate_once_in_order() {
        let published: Vec<u32> = (0..6).collect();
        for split in 0..=published.len() {
            let mut buffer = CandidateBuffer::new();
            let mut applied = Vec::new();
            for candidate in &published[..split] {
                if let Admission::Ready(c) = buffer.push(*candidate) {
                    applied.push(c);
                }
            }
            applied.extend(buffer.flush());
            for candidate in &published[split..] {
                if let Admission::Ready(c) = buffer.push(*candidate) {
                    applied.push(c);
                }
            }
            assert_eq!(applied, published, "split at {split}");
        }
    }
}
