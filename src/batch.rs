use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::core::{GenerationRequest, GenerationResult};
use crate::engine::Dispatcher;
use crate::error::GenerationError;
use crate::platforms;
use crate::progress::{Progress, ProgressScope, ProgressStage};

pub type BatchResults = BTreeMap<String, Result<GenerationResult, GenerationError>>;

/// Runs keyed requests on a bounded pool. Each request gets its own
/// sequential fallback chain; completion order across keys is unspecified.
/// Keys must be unique.
pub fn generate_all(
    dispatcher: &Dispatcher,
    requests: Vec<(String, GenerationRequest)>,
    workers: usize,
    tx: Option<&UnboundedSender<Progress>>,
) -> Result<BatchResults> {
    let mut seen = HashSet::new();
    if let Some((key, _)) = requests.iter().find(|(key, _)| !seen.insert(key.as_str())) {
        bail!("duplicate request key '{key}'");
    }
    let total = requests.len() as u64;
    let worker_count = workers.max(1).min(requests.len().max(1));
    info!(requests = total, workers = worker_count, "starting pooled generation");
    let done = AtomicU64::new(0);
    let send = |progress: Progress| {
        if let Some(tx) = tx {
            tx.send(progress).ok();
        }
    };

    send(Progress {
        scope: ProgressScope::Run,
        stage: ProgressStage::Queue,
        current: 0,
        total,
        status: format!("{total} targets on {worker_count} workers"),
        finished: total == 0,
    });

    let pool = ThreadPoolBuilder::new().num_threads(worker_count).build()?;
    let results = pool.install(|| {
        requests
            .into_par_iter()
            .map(|(key, request)| {
                let label = platforms::find(&key)
                    .map(|platform| platform.label.to_string())
                    .unwrap_or_else(|| key.clone());
                let scope = ProgressScope::Target {
                    key: key.clone(),
                    label,
                };
                send(Progress {
                    scope: scope.clone(),
                    stage: ProgressStage::Generate,
                    current: done.load(Ordering::SeqCst),
                    total,
                    status: request.capability.to_string(),
                    finished: false,
                });
                let outcome = dispatcher.execute(&request);
                let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                let (stage, status) = match &outcome {
                    Ok(result) => (ProgressStage::Done, result.provider_id.clone()),
                    Err(err) => (ProgressStage::Failed, err.to_string()),
                };
                send(Progress {
                    scope,
                    stage,
                    current,
                    total,
                    status,
                    finished: true,
                });
                (key, outcome)
            })
            .collect::<BatchResults>()
    });

    send(Progress {
        scope: ProgressScope::Run,
        stage: ProgressStage::Done,
        current: total,
        total,
        status: format!(
            "{} of {total} succeeded",
            results.values().filter(|result| result.is_ok()).count()
        ),
        finished: true,
    });
    Ok(results)
}
