use loopnode_core::detection::Detection;
use loopnode_core::types::Timestamp;

/// A recently seen detection, remembered for deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub detection: Detection,
    pub last_seen: Timestamp,
}

impl Observation {
    pub fn new(detection: Detection, seen: Timestamp) -> Self {
        Self {
            detection,
            last_seen: seen,
        }
    }

    pub fn is_stale(&self, now: Timestamp, window: chrono::Duration) -> bool {
        now - self.last_seen > window
    }

    /// Whether `candidate` describes the same object as this observation.
    ///
    /// Only boxes and points are compared; every other pairing (including
    /// mixed kinds) is dissimilar.
    pub fn matches(&self, candidate: &Detection, iou_threshold: f64, max_distance: f64) -> bool {
        if self.detection.category_name() != candidate.category_name() {
            return false;
        }
        match (&self.detection, candidate) {
            (Detection::Box(seen), Detection::Box(new)) => seen.iou(new) >= iou_threshold,
            (Detection::Point(seen), Detection::Point(new)) => seen.distance(new) < max_distance,
            _ => false,
        }
    }
}
