use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::protocol::{ClientEvent, ConnectionState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReadPerformance {
    pub reads: u64,
    pub successes: u64,
    pub total_latency_ms: f64,
    pub state_changes: u64,
    pub disconnects: u64,
    pub missed_events: u64,
}

impl ReadPerformance {
    pub fn success_rate(&self) -> Option<f64> {
        (self.reads > 0).then(|| self.successes as f64 / self.reads as f64)
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        (self.reads > 0).then(|| self.total_latency_ms / self.reads as f64)
    }

    fn add(&mut self, other: &ReadPerformance) {
        self.reads += other.reads;
        self.successes += other.successes;
        self.total_latency_ms += other.total_latency_ms;
        self.state_changes += other.state_changes;
        self.disconnects += other.disconnects;
        self.missed_events += other.missed_events;
    }
}

/// Aggregates client events published on the broadcast channel.
pub struct PerformanceTracker {
    rx: broadcast::Receiver<ClientEvent>,
    lifetime: ReadPerformance,
}

impl PerformanceTracker {
    pub fn new(rx: broadcast::Receiver<ClientEvent>) -> Self {
        Self {
            rx,
            lifetime: ReadPerformance::default(),
        }
    }

    /// Consume every event published since the last drain.
    pub fn drain(&mut self) -> ReadPerformance {
        let mut window = ReadPerformance::default();
        loop {
            match self.rx.try_recv() {
                Ok(ClientEvent::ReadCompleted { latency, success, .. }) => {
                    record_read(&mut window, latency, success)
                }
                Ok(ClientEvent::StateChanged { state, .. }) => {
                    window.state_changes += 1;
                    if state == ConnectionState::Disconnected {
                        window.disconnects += 1;
                    }
                }
                Err(TryRecvError::Lagged(n)) => window.missed_events += n,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        self.lifetime.add(&window);
        window
    }

    pub fn lifetime(&self) -> ReadPerformance {
        self.lifetime
    }
}

fn record_read(perf: &mut ReadPerformance, latency: Duration, success: bool) {
    perf.reads += 1;
    if success {
        perf.successes += 1;
    }
    perf.total_latency_ms += latency.as_secs_f64() * 1000.0;
}
