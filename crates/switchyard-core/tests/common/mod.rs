// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared setup for switchyard-core integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use switchyard_core::persistence::{self, Persistence};
use switchyard_core::{
    RetryPolicy, RunStatus, StepContext, StepHandler, StepOutcome, StepRuntime,
    StepRuntimeConfig, WorkflowCatalog, step_fn,
};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use uuid::Uuid;

/// Fresh in-memory SQLite store with migrations applied.
pub async fn memory_store() -> Arc<dyn Persistence> {
    persistence::connect("sqlite::memory:", 1)
        .await
        .expect("in-memory SQLite should connect")
}

/// Runtime over a fresh in-memory store.
pub async fn runtime_with(catalog: WorkflowCatalog, config: StepRuntimeConfig) -> Arc<StepRuntime> {
    Arc::new(StepRuntime::new(
        memory_store().await,
        Arc::new(catalog),
        config,
    ))
}

/// Retry policy with no backoff so retries are immediately due.
pub fn immediate_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO)
}

/// Shared execution counter.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Step that counts executions and completes with `output`.
pub fn counting_step(counter: Counter, output: Value) -> impl StepHandler {
    step_fn(move |_ctx: StepContext| {
        let counter = counter.clone();
        let output = output.clone();
        async move {
            counter.bump();
            Ok(StepOutcome::Complete(output))
        }
    })
}

/// Initialize a test subscriber once; repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until the run reaches `status`.
pub async fn wait_for_status(runtime: &StepRuntime, run_id: Uuid, status: RunStatus) {
    for _ in 0..200 {
        if runtime.get_run(run_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached {status}");
}

/// Formatted log output collected by [`capture_logs`].
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Index and text of the first line containing `needle`.
    pub fn find(&self, needle: &str) -> Option<(usize, String)> {
        self.contents()
            .lines()
            .enumerate()
            .find(|(_, line)| line.contains(needle))
            .map(|(i, line)| (i, line.to_string()))
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Collect this thread's log events until the guard drops.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}
