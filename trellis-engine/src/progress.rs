//! Progress reporting
//!
//! Steps report short human-readable status lines ("create: nat gateway",
//! "boot: waiting for running") through a [`StepReporter`]. Reporters of
//! quiet steps drop everything they are given.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Kind of a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    Started,
    Status,
    Finished,
    Failed,
}

/// One progress line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub node: Option<String>,
    pub kind: ProgressKind,
    pub message: String,
}

/// Destination of progress events
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&self, event: ProgressEvent) {
        match &event.node {
            Some(node) => info!(step = %event.step, node = %node, "{}", event.message),
            None => info!(step = %event.step, "{}", event.message),
        }
    }
}

/// Prints colored progress lines to stdout
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn report(&self, event: ProgressEvent) {
        let step = match event.kind {
            ProgressKind::Started => event.step.cyan(),
            ProgressKind::Status => event.step.normal(),
            ProgressKind::Finished => event.step.green(),
            ProgressKind::Failed => event.step.red(),
        };
        let node = event
            .node
            .as_deref()
            .map(|n| format!(" {}", n.bold()))
            .unwrap_or_default();

        println!(
            "{} [{}]{} {}",
            event.timestamp.format("%H:%M:%S").to_string().dimmed(),
            step,
            node,
            event.message
        );
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Drains all recorded events
    pub fn drain(&self) -> Vec<ProgressEvent> {
        let mut events = self.events.lock().unwrap();
        events.drain(..).collect()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Reports progress on behalf of one step, optionally for one node
#[derive(Clone)]
pub struct StepReporter {
    sink: Arc<dyn ProgressSink>,
    step: String,
    node: Option<String>,
    quiet: bool,
}

impl StepReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, step: impl Into<String>, quiet: bool) -> Self {
        Self {
            sink,
            step: step.into(),
            node: None,
            quiet,
        }
    }

    /// A reporter that drops everything
    pub fn silent() -> Self {
        Self::new(Arc::new(RecordingSink::new()), "", true)
    }

    /// The same reporter scoped to one node
    pub fn for_node(&self, node: &str) -> Self {
        Self {
            node: Some(node.to_string()),
            ..self.clone()
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(ProgressKind::Status, message.into());
    }

    pub fn started(&self) {
        self.emit(ProgressKind::Started, "started".to_string());
    }

    pub fn finished(&self) {
        self.emit(ProgressKind::Finished, "done".to_string());
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.emit(ProgressKind::Failed, message.into());
    }

    fn emit(&self, kind: ProgressKind, message: String) {
        if self.quiet {
            return;
        }
        self.sink.report(ProgressEvent {
            timestamp: Utc::now(),
            step: self.step.clone(),
            node: self.node.clone(),
            kind,
            message,
        });
    }
}
