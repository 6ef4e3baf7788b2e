// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Event capture for tests that assert on emitted `tracing` events.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use crate::metrics::METRICS_TARGET;

#[derive(Debug, Clone)]
pub(crate) struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub metric: Option<String>,
}

#[derive(Default)]
struct MetricField(Option<String>);

impl Visit for MetricField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "metric" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

#[derive(Clone, Default)]
pub(crate) struct CapturedEvents {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut metric = MetricField::default();
        event.record(&mut metric);
        let captured = CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            metric: metric.0,
        };
        self.events.lock().unwrap().push(captured);
    }
}

impl CapturedEvents {
    /// Runs `body` with a thread-local subscriber and returns what it emitted.
    pub fn record<R>(body: impl FnOnce() -> R) -> Self {
        let captured = Self::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        tracing::subscriber::with_default(subscriber, body);
        captured
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| event.level == Level::WARN)
            .count()
    }

    /// Names of the published metrics, in emission order.
    pub fn metric_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|event| event.target == METRICS_TARGET)
            .filter_map(|event| event.metric)
            .collect()
    }
}
