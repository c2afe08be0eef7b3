use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Process-wide request counters served at `/v1/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    processing_time_us: AtomicU64,
    by_status: Mutex<BTreeMap<u16, u64>>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Snapshot {
    pub total_requests_received: u64,
    pub total_responses_sent: u64,
    #[serde(rename = "total_processing_time_μs")]
    pub total_processing_time_us: u64,
    #[serde(rename = "average_processing_time_per_request_μs")]
    pub average_processing_time_us: u64,
    pub total_responses_sent_by_status: BTreeMap<u16, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_sent(&self, status: u16, elapsed_us: u64) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.processing_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
        *self
            .by_status
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(status)
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> Snapshot {
        let sent = self.responses_sent.load(Ordering::Relaxed);
        let total_us = self.processing_time_us.load(Ordering::Relaxed);
        Snapshot {
            total_requests_received: self.requests_received.load(Ordering::Relaxed),
            total_responses_sent: sent,
            total_processing_time_us: total_us,
            average_processing_time_us: total_us.checked_div(sent).unwrap_or(0),
            total_responses_sent_by_status: self
                .by_status
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }
}

pub async fn track(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    state.metrics.request_received();

    let response = next.run(request).await;

    let elapsed = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
    state.metrics.response_sent(response.status().as_u16(), elapsed);
    response
}

pub async fn show(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_no_average() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.total_responses_sent, 0);
        assert_eq!(snapshot.average_processing_time_us, 0);
        assert!(snapshot.total_responses_sent_by_status.is_empty());
    }

    #[test]
    fn counts_by_status_and_averages() {
        let metrics = Metrics::new();
        for (status, us) in [(200, 100), (200, 300), (404, 200)] {
            metrics.request_received();
            metrics.response_sent(status, us);
        }
        metrics.request_received();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests_received, 4);
        assert_eq!(snapshot.total_responses_sent, 3);
        assert_eq!(snapshot.total_processing_time_us, 600);
        assert_eq!(snapshot.average_processing_time_us, 200);
        assert_eq!(snapshot.total_responses_sent_by_status[&200], 2);
        assert_eq!(snapshot.total_responses_sent_by_status[&404], 1);
    }
}
