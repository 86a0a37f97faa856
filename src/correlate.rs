use std::fmt;

use tracing::{info, warn};

use crate::attributes::Attributes;
use crate::error::PayloadError;
use crate::payload::{RawPayload, SceneSample};
use crate::store::{DeviceIdentity, MetricsStore, StoreHttp, TestRecord};

/// Run-level facts that complete each sample's record key.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationContext<'a> {
    pub date_of_test: &'a str,
    pub apk_name: &'a str,
    pub device: &'a DeviceIdentity,
    /// Base64 screenshot stored on newly created records.
    pub image: Option<&'a str>,
}

/// What happened to one scene sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentOutcome {
    Created { scene_name: String, id: String },
    Appended { scene_name: String, id: String },
    /// More than one record holds the key; nothing was written.
    AmbiguousMatch { scene_name: String, ids: Vec<String> },
    StoreFailed { scene_name: String, error: String },
}

impl SegmentOutcome {
    pub fn scene_name(&self) -> &str {
        match self {
            SegmentOutcome::Created { scene_name, .. }
            | SegmentOutcome::Appended { scene_name, .. }
            | SegmentOutcome::AmbiguousMatch { scene_name, .. }
            | SegmentOutcome::StoreFailed { scene_name, .. } => scene_name,
        }
    }
}

/// Result of reconciling one payload with the metrics store.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationOutcome {
    /// Skip sentinel; the store was never contacted.
    Skipped,
    Correlated(Vec<SegmentOutcome>),
    /// Segments before the malformed one were still written.
    MalformedPayload {
        applied: Vec<SegmentOutcome>,
        error: PayloadError,
    },
}

impl CorrelationOutcome {
    pub fn segments(&self) -> &[SegmentOutcome] {
        match self {
            CorrelationOutcome::Skipped => &[],
            CorrelationOutcome::Correlated(segments) => segments,
            CorrelationOutcome::MalformedPayload { applied, .. } => applied,
        }
    }

    pub fn has_ambiguity(&self) -> bool {
        self.segments()
            .iter()
            .any(|segment| matches!(segment, SegmentOutcome::AmbiguousMatch { .. }))
    }
}

impl fmt::Display for CorrelationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mut created, mut appended, mut ambiguous, mut failed) = (0, 0, 0, 0);
        for segment in self.segments() {
            match segment {
                SegmentOutcome::Created { .. } => created += 1,
                SegmentOutcome::Appended { .. } => appended += 1,
                SegmentOutcome::AmbiguousMatch { .. } => ambiguous += 1,
                SegmentOutcome::StoreFailed { .. } => failed += 1,
            }
        }
        match self {
            CorrelationOutcome::Skipped => write!(f, "skipped"),
            CorrelationOutcome::Correlated(_) => write!(
                f,
                "created={created} appended={appended} ambiguous={ambiguous} failed={failed}"
            ),
            CorrelationOutcome::MalformedPayload { error, .. } => write!(
                f,
                "malformed ({error}); created={created} appended={appended} ambiguous={ambiguous} failed={failed}"
            ),
        }
    }
}

/// Reconciles scraped payloads with remote records, one record per key.
pub struct ResultCorrelator<'a, H: StoreHttp> {
    store: &'a MetricsStore<H>,
}

impl<'a, H: StoreHttp> ResultCorrelator<'a, H> {
    pub fn new(store: &'a MetricsStore<H>) -> Self {
        Self { store }
    }

    pub fn correlate(
        &self,
        payload: &RawPayload,
        attributes: &Attributes,
        context: &CorrelationContext<'_>,
    ) -> CorrelationOutcome {
        if payload.is_skip_sentinel() {
            info!(apk = context.apk_name, "skip sentinel; nothing sent to the metrics store");
            return CorrelationOutcome::Skipped;
        }

        let (segments, malformed) = payload.segments();
        let applied: Vec<SegmentOutcome> = segments
            .into_iter()
            .map(|segment| {
                let sample =
                    SceneSample::from_segment(segment, context.apk_name, context.date_of_test);
                self.correlate_sample(&sample, attributes, context)
            })
            .collect();

        match malformed {
            Some(error) => {
                warn!(
                    apk = context.apk_name,
                    error = %error,
                    "malformed payload; correlation halted"
                );
                CorrelationOutcome::MalformedPayload { applied, error }
            }
            None => CorrelationOutcome::Correlated(applied),
        }
    }

    fn correlate_sample(
        &self,
        sample: &SceneSample,
        attributes: &Attributes,
        context: &CorrelationContext<'_>,
    ) -> SegmentOutcome {
        let key = sample.key();
        let scene_name = sample.scene_name.clone();
        let failed = |error: String| {
            warn!(key = %key, error = %error, "metrics store call failed");
            SegmentOutcome::StoreFailed {
                scene_name: sample.scene_name.clone(),
                error,
            }
        };

        let ids = match self.store.find_records(&key) {
            Ok(ids) => ids,
            Err(err) => return failed(err.to_string()),
        };

        match ids.as_slice() {
            [] => {
                let record = TestRecord::new(&key, context.device, attributes, context.image);
                let id = match self.store.create_record(&record) {
                    Ok(id) => id,
                    Err(err) => return failed(err.to_string()),
                };
                info!(key = %key, id = %id, "created metrics record");
                match self.store.append_sample(&id, &sample.value) {
                    Ok(()) => SegmentOutcome::Created { scene_name, id },
                    Err(err) => {
                        failed(format!("record {id} created but sample not appended: {err}"))
                    }
                }
            }
            [id] => match self.store.append_sample(id, &sample.value) {
                Ok(()) => {
                    info!(key = %key, id = %id, value = %sample.value, "appended sample");
                    SegmentOutcome::Appended {
                        scene_name,
                        id: id.clone(),
                    }
                }
                Err(err) => failed(err.to_string()),
            },
            _ => {
                warn!(
                    key = %key,
                    matches = ids.len(),
                    "several records share one key; sample not written"
                );
                SegmentOutcome::AmbiguousMatch { scene_name, ids }
            }
        }
    }
}
