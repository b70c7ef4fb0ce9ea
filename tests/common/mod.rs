#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use forestcache::{
    clock::Clock,
    config::Config,
    coordinator::CacheCoordinator,
    runtime::{ExternalComputation, LaunchSpec, RuntimeBridge, RuntimeLauncher},
    service::Service,
    store::ResultStore,
    Operation,
};
use tempfile::TempDir;

pub const START: u64 = 1_700_000_000;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Shared view into what the fake runtime was asked to do.
#[derive(Default)]
pub struct Recorder {
    pub launches: AtomicUsize,
    pub training_calls: AtomicUsize,
    pub prediction_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub fail_next_start: AtomicBool,
    /// The next call loses its connection to the runtime.
    pub drop_next_call: AtomicBool,
    pub delay_ms: AtomicUsize,
    outputs: Mutex<HashMap<Operation, String>>,
    pub configured: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub training_params: Mutex<Vec<(i64, i64)>>,
    pub payloads: Mutex<Vec<String>>,
    pub launch_specs: Mutex<Vec<LaunchSpec>>,
}

impl Recorder {
    pub fn set_output(&self, op: Operation, out: &str) {
        self.outputs.lock().unwrap().insert(op, out.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn calls(&self, op: Operation) -> usize {
        match op {
            Operation::Training => self.training_calls.load(Ordering::SeqCst),
            Operation::Prediction => self.prediction_calls.load(Ordering::SeqCst),
        }
    }

    fn output(&self, op: Operation) -> String {
        self.outputs
            .lock()
            .unwrap()
            .get(&op)
            .cloned()
            .unwrap_or_else(|| format!("{{\"operation\":\"{op}\"}}"))
    }
}

pub struct FakeLauncher {
    pub recorder: Arc<Recorder>,
}

#[async_trait]
impl RuntimeLauncher for FakeLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ExternalComputation>> {
        self.recorder.launches.fetch_add(1, Ordering::SeqCst);
        self.recorder.launch_specs.lock().unwrap().push(spec.clone());
        // Widen the window in which a second starter could race in.
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.recorder.fail_next_start.swap(false, Ordering::SeqCst) {
            bail!("interpreter library not found");
        }
        let computation: Box<dyn ExternalComputation> =
            Box::new(FakeComputation { recorder: self.recorder.clone(), connected: true });
        Ok(computation)
    }
}

struct FakeComputation {
    recorder: Arc<Recorder>,
    connected: bool,
}

impl FakeComputation {
    async fn run(&mut self, op: Operation, payload: &str) -> Result<String> {
        if !self.connected {
            bail!("writing to interpreter: Broken pipe");
        }
        if self.recorder.drop_next_call.swap(false, Ordering::SeqCst) {
            self.connected = false;
            bail!("interpreter exited");
        }
        match op {
            Operation::Training => self.recorder.training_calls.fetch_add(1, Ordering::SeqCst),
            Operation::Prediction => self.recorder.prediction_calls.fetch_add(1, Ordering::SeqCst),
        };
        self.recorder.payloads.lock().unwrap().push(payload.to_string());
        self.recorder.in_flight.fetch_add(1, Ordering::SeqCst);
        let delay = self.recorder.delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        let out = self.recorder.output(op);
        if out == "!raise" {
            bail!("ValueError: could not convert string to float");
        }
        Ok(out)
    }
}

#[async_trait]
impl ExternalComputation for FakeComputation {
    async fn configure(&mut self, config_file: &Path, work_dir: &Path) -> Result<()> {
        self.recorder
            .configured
            .lock()
            .unwrap()
            .push((config_file.to_path_buf(), work_dir.to_path_buf()));
        Ok(())
    }

    async fn train_with(&mut self, payload: &str, random_state: i64, estimators: i64) -> Result<String> {
        self.recorder
            .training_params
            .lock()
            .unwrap()
            .push((random_state, estimators));
        self.run(Operation::Training, payload).await
    }

    async fn predict_with(&mut self, payload: &str) -> Result<String> {
        self.run(Operation::Prediction, payload).await
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub rc: PathBuf,
    pub clock: Arc<ManualClock>,
    pub recorder: Arc<Recorder>,
    pub bridge: Arc<RuntimeBridge>,
    pub coordinator: Arc<CacheCoordinator>,
    pub service: Service,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_ttl(300)
    }

    pub fn with_ttl(ttl_secs: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("modules/Forest/Utilities")).unwrap();
        fs::write(root.join("modules/Forest/ForestModule.py"), "# forest\n").unwrap();
        fs::write(root.join("modules/Forest/Utilities/ForestLogger.py"), "# log\n").unwrap();
        fs::write(root.join("runtime.properties"), "FOREST_HOME=/opt/forest\n").unwrap();

        let rc = root.join(".forestcacherc");
        write_rc(&rc, root, ttl_secs, "work");

        let cfg = Config::load_from(&rc);
        let settings = cfg.settings().unwrap();
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(START)));
        let recorder = Arc::new(Recorder::default());
        let launcher = Arc::new(FakeLauncher { recorder: recorder.clone() });

        let bridge = Arc::new(RuntimeBridge::new(&settings.runtime, &rc, launcher));
        let store = ResultStore::new(&settings.store_root, settings.ttl, clock.clone());
        let coordinator = Arc::new(CacheCoordinator::new(
            store,
            bridge.clone(),
            settings.compute_input.clone(),
        ));
        let service = Service::new(coordinator.clone(), &rc);

        Self { dir, rc, clock, recorder, bridge, coordinator, service }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Rewrites the config file with a different model work directory.
    pub fn set_work_dir(&self, name: &str) {
        write_rc(&self.rc, self.root(), self.coordinator.store().ttl().as_secs(), name);
    }

    pub fn store(&self) -> &ResultStore {
        self.coordinator.store()
    }
}

fn write_rc(rc: &Path, root: &Path, ttl_secs: u64, work: &str) {
    let body = format!(
        "RESULT_STORE_PATH={results}\n\
         CACHE_TTL_SECS={ttl_secs}\n\
         MODULES_ROOT={modules}\n\
         RUNTIME_MODULES=Forest/ForestModule.py,Forest/Utilities/ForestLogger.py\n\
         STAGING_ROOT={staging}\n\
         RUNTIME_ENV_FILE={env}\n\
         MODEL_CONFIG_FILE={model_conf}\n\
         MODEL_WORK_DIR={work}\n\
         TRAINING_SETTINGS_PATH={training}\n\
         TRAINING_RANDOM_STATE=42\n\
         TRAINING_ESTIMATORS=100\n\
         COMPUTE_INPUT=http://translator.local/dataset\n",
        results = root.join("results").display(),
        modules = root.join("modules").display(),
        staging = root.join("staging").display(),
        env = root.join("runtime.properties").display(),
        model_conf = root.join("rfConf.properties").display(),
        work = root.join(work).display(),
        training = root.join("training.json").display(),
    );
    fs::write(rc, body).unwrap();
}
