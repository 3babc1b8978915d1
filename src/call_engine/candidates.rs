//! Puffer für Remote ICE Candidates
//!
//! Candidates können vor der Remote Description eintreffen. Bis diese
//! gesetzt ist, werden sie hier gesammelt und danach in
//! Empfangsreihenfolge übernommen.

use std::collections::VecDeque;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// Begrenzte Warteschlange für frühe Candidates
#[derive(Debug)]
pub struct CandidateQueue {
    pending: VecDeque<RTCIceCandidateInit>,
    capacity: usize,
    remote_description_set: bool,
}

impl CandidateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            remote_description_set: false,
        }
    }

    /// Nimmt einen Candidate an.
    ///
    /// Gibt ihn zurück, wenn die Remote Description bereits gesetzt ist
    /// und er sofort hinzugefügt werden kann.
    pub fn offer(&mut self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        if self.remote_description_set {
            return Some(candidate);
        }

        if self.pending.len() >= self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(
                    "Candidate buffer full ({}), dropping oldest: {}",
                    self.capacity,
                    dropped.candidate
                );
            }
        }

        self.pending.push_back(candidate);
        None
    }

    /// Markiert die Remote Description als gesetzt und gibt alle
    /// gepufferten Candidates zurück
    pub fn release(&mut self) -> Vec<RTCIceCandidateInit> {
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.remote_description_set
    }

    /// Zurück auf Anfang (Teardown)
    pub fn reset(&mut self) {
        self.pending.clear();
        self.remote_description_set = false;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.168.1.{n} 5000{n} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn test_buffers_until_released() {
        let mut queue = CandidateQueue::new(8);

        for n in 1..=3 {
            assert!(queue.offer(candidate(n)).is_none());
        }
        assert_eq!(queue.len(), 3);

        let released = queue.release();
        assert_eq!(released.len(), 3);
        assert_eq!(released[0].candidate, candidate(1).candidate);
        assert_eq!(released[2].candidate, candidate(3).candidate);
        assert!(queue.is_empty());

        // Danach direkt durchreichen
        assert!(queue.offer(candidate(4)).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let mut queue = CandidateQueue::new(2);
        queue.offer(candidate(1));
        queue.offer(candidate(2));
        queue.offer(candidate(3));

        let released = queue.release();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].candidate, candidate(2).candidate);
    }

    #[test]
    fn test_reset() {
        let mut queue = CandidateQueue::new(4);
        queue.release();
        assert!(queue.is_released());

        queue.reset();
        assert!(!queue.is_released());
        assert!(queue.offer(candidate(1)).is_none());
        assert_eq!(queue.len(), 1);
    }
}
