//! Shared fixtures: small deterministic services and a dispatcher
//! builder tuned for fast supervision cycles.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fanout::auth::AuthManager;
use fanout::config::Config;
use fanout::dispatcher::Dispatcher;
use fanout::registry::Registry;
use fanout::services::{Service, ServiceResult, SharedService};
use fanout_types::{ServiceSpec, TokensFile};

/// Echoes and records every request it sees.
pub struct RecordingService {
    spec: ServiceSpec,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingService {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_spec(ServiceSpec {
            name: name.to_string(),
            ..ServiceSpec::default()
        })
    }

    pub fn with_spec(spec: ServiceSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Service for RecordingService {
    fn spec(&self) -> ServiceSpec {
        self.spec.clone()
    }

    fn run(&self, request: &str) -> ServiceResult<Value> {
        self.calls.lock().unwrap().push(request.to_string());
        Ok(json!({ "echo": request }))
    }
}

/// Blocks inside `run` long enough to look dead to the supervisor.
pub struct SleeperService {
    spec: ServiceSpec,
    pub sleep: Duration,
}

impl SleeperService {
    pub fn new(spec: ServiceSpec, sleep: Duration) -> Arc<Self> {
        Arc::new(Self { spec, sleep })
    }
}

impl Service for SleeperService {
    fn spec(&self) -> ServiceSpec {
        self.spec.clone()
    }

    fn run(&self, request: &str) -> ServiceResult<Value> {
        std::thread::sleep(self.sleep);
        Ok(json!({ "slept": request }))
    }
}

/// Fails on the magic request, succeeds otherwise.
pub struct FlakyService {
    spec: ServiceSpec,
}

impl FlakyService {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            spec: ServiceSpec {
                name: name.to_string(),
                ..ServiceSpec::default()
            },
        })
    }
}

impl Service for FlakyService {
    fn spec(&self) -> ServiceSpec {
        self.spec.clone()
    }

    fn run(&self, request: &str) -> ServiceResult<Value> {
        if request == "bad" {
            Err(fanout::services::ServiceError::runtime("boom"))
        } else {
            Ok(json!({ "ok": request }))
        }
    }
}

/// Config with sub-second supervision knobs and both bypasses on.
pub fn fast_config() -> Config {
    Config {
        bypass_user_auth: true,
        bypass_admin_auth: true,
        terminator_idle_cycle: 0.1,
        th_proc_response_time: 0.1,
        service_start_timeout: 1.0,
        service_shutdown_timeout: 1.0,
        max_service_run_time: 30,
        ..Config::default()
    }
}

pub fn dispatcher_with(services: Vec<SharedService>, config: &Config) -> Arc<Dispatcher> {
    utils::init_tracing_tests();
    let registry = Arc::new(Registry::new(services, config).unwrap());
    let auth = AuthManager::from_tokens(
        TokensFile::default(),
        &config.token_regex,
        config.bypass_user_auth,
        config.bypass_admin_auth,
    )
    .unwrap();
    Arc::new(Dispatcher::with_auth(registry, config, auth).unwrap())
}
