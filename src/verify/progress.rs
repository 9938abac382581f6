/// Turns queue counts into a completion percentage
pub struct ProgressTracker;

impl ProgressTracker {
    /// Share of the run that is done, 0 to 100.
    ///
    /// A run with nothing to do is complete. Requeued candidates can push
    /// `remaining` above `total`, which reads as 0.
    pub fn percent(total: usize, remaining: usize) -> u8 {
        if total == 0 || remaining == 0 {
            return 100;
        }
        let done = total.saturating_sub(remaining);
        (done * 100 / total).min(100) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_run_is_complete() {
        assert_eq!(ProgressTracker::percent(0, 0), 100);
        assert_eq!(ProgressTracker::percent(0, 3), 100);
    }

    #[test]
    fn test_partial_progress() {
        assert_eq!(ProgressTracker::percent(5, 3), 40);
        assert_eq!(ProgressTracker::percent(5, 5), 0);
        assert_eq!(ProgressTracker::percent(3, 1), 66);
        assert_eq!(ProgressTracker::percent(5, 0), 100);
    }

    #[test]
    fn test_requeues_never_underflow() {
        assert_eq!(ProgressTracker::percent(2, 7), 0);
    }
}
