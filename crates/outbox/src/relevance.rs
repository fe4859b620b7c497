//! Decides which detector images are worth uploading.
//!
//! Every grouping key (typically a camera id) keeps its own short history
//! of [`Observation`]s.  A batch is interesting when it contains an object
//! not seen recently with uncertain confidence, any segmentation or
//! classification result, or an implausibly high number of detections.

use std::collections::HashMap;
use std::sync::Arc;

use loopnode_core::detection::{Detection, ImageMetadata};
use loopnode_core::types::Timestamp;
use tokio::sync::Mutex;

use crate::observation::Observation;
use crate::outbox::Outbox;

pub const CAUSE_UNCERTAIN: &str = "uncertain";
pub const CAUSE_SEGMENTATION: &str = "segmentation_detection";
pub const CAUSE_CLASSIFICATION: &str = "classification_detection";
pub const CAUSE_UNEXPECTED_COUNT: &str = "unexpected_observations_count";

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Observations not seen again within this window are forgotten.
    pub reset_window: chrono::Duration,
    /// Minimum IoU for two boxes of the same category to be the same object.
    pub iou_threshold: f64,
    /// Points closer than this many pixels are the same object.
    pub point_distance: f64,
    /// Inclusive confidence band regarded as uncertain.
    pub uncertain_min: f64,
    pub uncertain_max: f64,
    /// Batches with more detections than this are always uploaded.
    pub max_detections: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            reset_window: chrono::Duration::hours(1),
            iou_threshold: 0.5,
            point_distance: 10.0,
            uncertain_min: 0.3,
            uncertain_max: 0.6,
            max_detections: 80,
        }
    }
}

/// Per-group observation history and the relevance rules.
#[derive(Debug, Default)]
pub struct RelevanceFilter {
    config: FilterConfig,
    groups: HashMap<String, Vec<Observation>>,
}

impl RelevanceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            groups: HashMap::new(),
        }
    }

    pub fn observation_count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, Vec::len)
    }

    /// Drop observations whose `last_seen` is older than the reset window.
    pub fn evict_stale(&mut self, now: Timestamp) {
        let window = self.config.reset_window;
        for observations in self.groups.values_mut() {
            observations.retain(|o| !o.is_stale(now, window));
        }
        self.groups.retain(|_, observations| !observations.is_empty());
    }

    /// Update `group`'s history with `detections` and return the causes that
    /// make this batch worth uploading. An empty list means "skip".
    pub fn evaluate(&mut self, group: &str, detections: &[Detection], now: Timestamp) -> Vec<String> {
        self.evict_stale(now);

        let config = &self.config;
        let history = self.groups.entry(group.to_string()).or_default();
        let mut causes: Vec<String> = Vec::new();
        let mut add = |cause: &str| {
            if !causes.iter().any(|c| c == cause) {
                causes.push(cause.to_string());
            }
        };

        for detection in detections {
            match detection {
                Detection::Box(_) | Detection::Point(_) => {
                    let known = history.iter_mut().find(|o| {
                        o.matches(detection, config.iou_threshold, config.point_distance)
                    });
                    match known {
                        Some(observation) => observation.last_seen = now,
                        None => {
                            history.push(Observation::new(detection.clone(), now));
                            let confidence = detection.confidence();
                            if (config.uncertain_min..=config.uncertain_max).contains(&confidence) {
                                add(CAUSE_UNCERTAIN);
                            }
                        }
                    }
                }
                Detection::Segmentation(_) => add(CAUSE_SEGMENTATION),
                Detection::Classification(_) => add(CAUSE_CLASSIFICATION),
            }
        }

        if detections.len() > config.max_detections {
            add(CAUSE_UNEXPECTED_COUNT);
        }

        if history.is_empty() {
            self.groups.remove(group);
        }
        causes
    }
}

/// [`RelevanceFilter`] wired to an [`Outbox`]: relevant images are tagged
/// with their causes and queued for upload.
pub struct ObservationFilter {
    filter: Mutex<RelevanceFilter>,
    outbox: Arc<Outbox>,
}

impl ObservationFilter {
    pub fn new(config: FilterConfig, outbox: Arc<Outbox>) -> Self {
        Self {
            filter: Mutex::new(RelevanceFilter::new(config)),
            outbox,
        }
    }

    pub async fn observation_count(&self, group: &str) -> usize {
        self.filter.lock().await.observation_count(group)
    }

    /// Evaluate `metadata.detections` for `group` and queue the image when
    /// relevant. Returns the causes whether or not the save succeeded.
    pub async fn process(&self, group: &str, image: &[u8], mut metadata: ImageMetadata) -> Vec<String> {
        let causes = self
            .filter
            .lock()
            .await
            .evaluate(group, &metadata.detections, chrono::Utc::now());

        if causes.is_empty() {
            return causes;
        }

        metadata.add_tags(causes.iter().cloned());
        if metadata.source.is_none() {
            metadata.source = Some(group.to_string());
        }
        if let Err(e) = self.outbox.save(image, &metadata).await {
            tracing::error!(group, error = %e, "Failed to queue relevant image");
        }
        causes
    }
}
