use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use flagsync_core::{FlagPatch, FlagRecord};
use flagsync_engine::{FlagGateway, GatewayError};

const PARKED_CALLS_CEILING: usize = 1024;

/// Holds calls until released, once closed.
struct Gate {
    closed: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }

    async fn pass(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Stop holding new calls and let every parked one through.
    fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.permits.add_permits(PARKED_CALLS_CEILING);
    }
}

/// Wraps a real gateway with call recording, queued failures and gates that
/// hold calls in flight until a test releases them.
pub struct ScriptedGateway {
    inner: Arc<dyn FlagGateway>,
    fetch_calls: AtomicUsize,
    mutate_calls: AtomicUsize,
    mutated_keys: Mutex<Vec<String>>,
    fetch_failures: Mutex<VecDeque<GatewayError>>,
    mutate_failures: Mutex<VecDeque<GatewayError>>,
    fetch_gate: Gate,
    mutate_gate: Gate,
    read_on_arrival: AtomicBool,
}

impl ScriptedGateway {
    pub fn new(inner: Arc<dyn FlagGateway>) -> Self {
        Self {
            inner,
            fetch_calls: AtomicUsize::new(0),
            mutate_calls: AtomicUsize::new(0),
            mutated_keys: Mutex::new(Vec::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            mutate_failures: Mutex::new(VecDeque::new()),
            fetch_gate: Gate::new(),
            mutate_gate: Gate::new(),
            read_on_arrival: AtomicBool::new(false),
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn mutate_calls(&self) -> usize {
        self.mutate_calls.load(Ordering::SeqCst)
    }

    pub fn mutated_keys(&self) -> Vec<String> {
        self.mutated_keys.lock().clone()
    }

    /// The next `n` fetches fail with `err`.
    pub fn fail_fetches(&self, n: usize, err: GatewayError) {
        let mut failures = self.fetch_failures.lock();
        for _ in 0..n {
            failures.push_back(err.clone());
        }
    }

    /// The next mutation fails with `err`, after passing the mutate gate.
    pub fn fail_next_mutation(&self, err: GatewayError) {
        self.mutate_failures.lock().push_back(err);
    }

    /// Fetches read the server (and take any queued failure) as soon as they
    /// arrive, then wait at the fetch gate before answering. Models a
    /// response that is already on the wire when something else happens.
    pub fn read_fetches_on_arrival(&self) {
        self.read_on_arrival.store(true, Ordering::SeqCst);
    }

    pub fn hold_fetches(&self) {
        self.fetch_gate.close();
    }

    pub fn release_fetches(&self, n: usize) {
        self.fetch_gate.release(n);
    }

    pub fn resume_fetches(&self) {
        self.fetch_gate.open();
    }

    pub fn hold_mutations(&self) {
        self.mutate_gate.close();
    }

    pub fn release_mutations(&self, n: usize) {
        self.mutate_gate.release(n);
    }

    pub fn resume_mutations(&self) {
        self.mutate_gate.open();
    }
}

#[async_trait]
impl FlagGateway for ScriptedGateway {
    async fn fetch_all(&self) -> Result<Vec<FlagRecord>, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.read_on_arrival.load(Ordering::SeqCst) {
            let failure = self.fetch_failures.lock().pop_front();
            let result = match failure {
                Some(err) => Err(err),
                None => self.inner.fetch_all().await,
            };
            self.fetch_gate.pass().await;
            return result;
        }

        self.fetch_gate.pass().await;
        let failure = self.fetch_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.fetch_all().await
    }

    async fn mutate(&self, key: &str, patch: FlagPatch) -> Result<FlagRecord, GatewayError> {
        self.mutate_calls.fetch_add(1, Ordering::SeqCst);
        self.mutated_keys.lock().push(key.to_string());
        self.mutate_gate.pass().await;
        let failure = self.mutate_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.mutate(key, patch).await
    }
}
