/***
 *
 * High-level system design
 *
 * The Dispatcher is the front door for every user call. It validates and
 * authorizes the request, consults the per-service result cache, and only
 * then submits work to the engine's worker pools. Responses come back on
 * one shared output channel per service, so the dispatcher re-establishes
 * caller <-> response correspondence with the request-id protocol:
 *
 * <Dispatcher> --(request_id, payload)--> <Pool input channel>
 *                                             | workers
 * <Dispatcher> <--(request_id, output)--- <Pool output channel>
 *
 * Because several caller threads drain the same output channel, a thread
 * may pop a response belonging to a different caller. Such strays are
 * parked on a per-service tmp queue where the rightful caller looks for
 * them; entries that age out there are resolved straight into the cache
 * for whoever coalesced onto the same request string.
 *
 * The HTTP layer calls into this type through spawn_blocking: the
 * correlation loop deliberately blocks with short channel timeouts
 * instead of being async, mirroring how the engine side is plain threads.
 *
 ***/

mod api;
mod cache;

pub use cache::ResultCache;

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fanout_types::{
    CachedResult, DispatchResponse, Output, Payload, RequestId, ServerBlock, ServiceId,
};

use crate::auth::AuthManager;
use crate::config::Config;
use crate::registry::Registry;
use crate::subsystems::engine::{Engine, EngineSettings};

/// Blocking receive timeout of one correlation-loop iteration.
const GET_TIMEOUT: Duration = Duration::from_millis(10);
/// Iterations between pending-ledger checks, roughly 2s worth.
const GET_ITER: u32 = 200;
/// How many tmp-queue entries one iteration may drain.
const TMP_ITER: usize = 20;
/// Retry count after which a stray tmp entry is written to the cache.
const TMP_MAX_RETRIES: u32 = 20;

const INCOMPLETE_ONE: &str =
    "Result is incomplete. Some service did not process request in time";
const INCOMPLETE_MANY: &str =
    "Results are incomplete. Some service did not process requests in time";
const INSUFFICIENT_PERMISSIONS: &str = "Insufficient permissions";
const NOT_RUNNING: &str = "Server is not running";
const REQUEST_INVALID: &str = "Request validation failed";

/// A response popped by one caller thread but belonging to another.
struct TmpEntry {
    retries: u32,
    id: RequestId,
    output: Output,
}

/// What the caller expects back, used to pair outputs with the request
/// strings they answer so results land in the cache under the right key.
#[derive(Clone, Copy)]
enum Expect<'a> {
    One(&'a str),
    Many(&'a [String]),
}

enum Correlated {
    One(CachedResult),
    Many(Vec<CachedResult>),
}

pub struct Dispatcher {
    pub registry: Arc<Registry>,
    pub engine: Engine,
    pub auth: AuthManager,
    cache: ResultCache,
    tmp: Vec<Mutex<VecDeque<TmpEntry>>>,
    config: Config,
    version: &'static str,
}

impl Dispatcher {
    /// Builds the full stack: auth from the configured token file, the
    /// engine with one pool per registered service, and starts services.
    pub fn new(registry: Arc<Registry>, config: &Config) -> anyhow::Result<Self> {
        let auth = AuthManager::new(
            &config.tokens_path,
            &config.token_regex,
            config.bypass_user_auth,
            config.bypass_admin_auth,
        )?;
        Self::with_auth(registry, config, auth)
    }

    /// Same but with a pre-built auth manager; used by tests that load
    /// tokens from memory instead of disk.
    pub fn with_auth(
        registry: Arc<Registry>,
        config: &Config,
        auth: AuthManager,
    ) -> anyhow::Result<Self> {
        if auth.len_users() == 0 && auth.len_superusers() == 0 && !config.bypass_user_auth {
            anyhow::bail!(
                "There are no users nor superusers and bypass_user_auth is false. \
                 It would be impossible to run any service."
            );
        }

        let engine = Engine::new(&registry, EngineSettings::from(config));
        engine.start_services();

        let services = registry.len();
        Ok(Self {
            cache: ResultCache::new(services, config.max_database_size, config.max_result_age()),
            tmp: (0..services).map(|_| Mutex::new(VecDeque::new())).collect(),
            registry,
            engine,
            auth,
            config: config.clone(),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    /// Stops everything including the supervision helpers and drops all
    /// cached results. The dispatcher is unusable afterwards.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.cache.clear();
        tracing::debug!("Dispatcher: shutdown complete");
    }

    pub fn start_services(&self) -> bool {
        self.engine.start_services()
    }

    pub fn stop_services(&self) -> bool {
        self.engine.stop_services()
    }

    pub fn restart_services(&self) -> bool {
        self.engine.restart_services()
    }

    /// Swaps the in-memory token tables for the on-disk state. The old
    /// tables stay in place when the file fails to load.
    pub fn reload_tokens(&self) -> bool {
        match self.auth.reload(&self.config.tokens_path) {
            Ok(()) => {
                tracing::info!("Dispatcher: tokens successfully reloaded");
                true
            }
            Err(err) => {
                tracing::error!(
                    "Dispatcher: cannot load tokens from: {}, validation failed: {}",
                    self.config.tokens_path.display(),
                    err
                );
                false
            }
        }
    }

    fn validate_request(&self, request: &str) -> bool {
        if request.len() > self.config.max_message_size {
            tracing::debug!("Dispatcher: request validation failed: request too big");
            return false;
        }
        true
    }

    // ======================= dispatch operations =======================

    /// Single request to a single service.
    pub fn get_service(
        &self,
        service_id: ServiceId,
        request: &str,
        token: &str,
        caching: bool,
    ) -> DispatchResponse {
        let timer = Instant::now();
        let error_block = || ServerBlock {
            service_id: Some(service_id),
            ..ServerBlock::ok(json!(request))
        };

        if !self.engine.running() {
            tracing::info!("{}: get_service: Server is not running service_id: {}", token, service_id);
            return DispatchResponse::error(error_block(), NOT_RUNNING);
        }
        if !self.validate_request(request) {
            tracing::info!("{}: get_service: Request validation failed service_id: {}", token, service_id);
            return DispatchResponse::error(error_block(), REQUEST_INVALID);
        }
        if !self.registry.contains(service_id) {
            tracing::info!("{}: get_service: Invalid service ID service_id: {}", token, service_id);
            return DispatchResponse::error(error_block(), "Invalid service_id");
        }
        if !self.auth.authorize_user(token, service_id) {
            tracing::info!("{}: get_service: Insufficient permissions service_id: {}", token, service_id);
            return DispatchResponse::error(error_block(), INSUFFICIENT_PERMISSIONS);
        }
        tracing::info!("{}: get_service: Incoming request service_id: {}", token, service_id);

        let name = self.registry.descriptor(service_id).expect("validated").name.clone();
        let mut response =
            DispatchResponse::new(ServerBlock::service(json!(request), service_id, &name));

        if caching {
            if let Some(entry) = self.cache.get(service_id, request) {
                response.outputs.insert(name, to_json(&entry));
                response.server = response.server.timed(timer.elapsed().as_secs_f64());
                return response;
            }
        }

        let request_id = self
            .engine
            .submit(service_id, Payload::One(request.to_string()))
            .expect("single payloads always submit");
        let expect = Expect::One(request);

        let mut iter_count = 0u32;
        let mut backoff = 0u32;
        let correlated = loop {
            // another caller may have populated the cache for us
            if let Some(entry) = self.cache.get(service_id, request) {
                break Some(Correlated::One(entry));
            }
            if let Some(found) = self.drain_tmp(service_id, request_id, expect) {
                break Some(found);
            }
            if let Some(found) = self.poll_output(service_id, request_id, expect) {
                break Some(found);
            }

            iter_count += 1;
            if iter_count >= GET_ITER {
                iter_count = 0;
                if !self.engine.is_pending(service_id, request_id) {
                    tracing::error!(
                        "{}: get_service: Request returned incomplete due to no longer pending request_id: {} service_id: {}",
                        token,
                        request_id,
                        service_id
                    );
                    break None;
                }
                backoff_sleep(&mut backoff);
            }
        };

        match correlated {
            Some(found) => {
                response.outputs.insert(name, correlated_to_json(found));
            }
            None => {
                response.server = response.server.fail(INCOMPLETE_ONE);
            }
        }
        self.engine.gc_done(service_id, request_id);
        response.server = response.server.timed(timer.elapsed().as_secs_f64());
        response
    }

    /// Single request fanned out to a group. Digit-only names route to
    /// [`Dispatcher::get_service`].
    pub fn get_group(
        &self,
        group: &str,
        request: &str,
        token: &str,
        caching: bool,
    ) -> DispatchResponse {
        let timer = Instant::now();
        let error_block = || ServerBlock::group(json!(request), group);

        if !self.engine.running() {
            tracing::info!("{}: get_group: Server is not running group: {}", token, group);
            return DispatchResponse::error(error_block(), NOT_RUNNING);
        }
        if let Ok(service_id) = group.parse::<ServiceId>() {
            // digit strings are service ids in URLs
            return self.get_service(service_id, request, token, caching);
        }
        if !self.validate_request(request) {
            tracing::info!("{}: get_group: Request validation failed group: {}", token, group);
            return DispatchResponse::error(error_block(), REQUEST_INVALID);
        }

        let members = self
            .registry
            .resolve_group(group, self.config.key_sensitivity);
        if members.is_empty() {
            tracing::info!("{}: get_group: Invalid group name group: {}", token, group);
            return DispatchResponse::error(
                error_block(),
                format!("Group name '{}' is not implemented or is invalid", group),
            );
        }
        let authorized = self
            .auth
            .filter_authorized(token, &members.iter().map(|(id, _)| *id).collect::<Vec<_>>());
        let members: Vec<_> = members
            .into_iter()
            .filter(|(id, _)| authorized.contains(id))
            .collect();
        if members.is_empty() {
            tracing::info!("{}: get_group: Insufficient permissions group: {}", token, group);
            return DispatchResponse::error(error_block(), INSUFFICIENT_PERMISSIONS);
        }
        tracing::info!("{}: get_group: Incoming request group: {}", token, group);

        let mut response = DispatchResponse::new(ServerBlock {
            service_ids: Some(members.iter().map(|(id, _)| *id).collect()),
            service_names: Some(members.iter().map(|(_, name)| name.clone()).collect()),
            ..ServerBlock::group(json!(request), group)
        });

        let mut done = vec![false; members.len()];
        let mut submitted: Vec<Option<RequestId>> = vec![None; members.len()];
        let mut remaining = members.len();

        for (index, (service_id, name)) in members.iter().enumerate() {
            let cached = if caching {
                self.cache.get(*service_id, request)
            } else {
                None
            };
            match cached {
                Some(entry) => {
                    response.outputs.insert(name.clone(), to_json(&entry));
                    done[index] = true;
                    remaining -= 1;
                }
                None => {
                    submitted[index] = self
                        .engine
                        .submit(*service_id, Payload::One(request.to_string()));
                }
            }
        }

        let expect = Expect::One(request);
        let mut iter_count = 0u32;
        let mut backoff = 0u32;
        while remaining > 0 {
            for (index, (service_id, name)) in members.iter().enumerate() {
                if done[index] {
                    continue;
                }
                let request_id = submitted[index].expect("submitted unless cached");

                let found = self
                    .cache
                    .get(*service_id, request)
                    .map(Correlated::One)
                    .or_else(|| self.drain_tmp(*service_id, request_id, expect))
                    .or_else(|| self.poll_output(*service_id, request_id, expect));

                if let Some(found) = found {
                    response
                        .outputs
                        .insert(name.clone(), correlated_to_json(found));
                    done[index] = true;
                    remaining -= 1;
                    self.engine.gc_done(*service_id, request_id);
                }
            }

            iter_count += 1;
            if iter_count >= GET_ITER {
                iter_count = 0;
                let still_pending = members.iter().enumerate().any(|(index, (service_id, _))| {
                    !done[index]
                        && submitted[index]
                            .map(|request_id| self.engine.is_pending(*service_id, request_id))
                            .unwrap_or(false)
                });
                if !still_pending {
                    tracing::error!(
                        "{}: get_group: Request returned incomplete due to no longer pending group: {}",
                        token,
                        group
                    );
                    response.server = response.server.fail(INCOMPLETE_ONE);
                    break;
                }
                backoff_sleep(&mut backoff);
            }
        }

        response.server = response.server.timed(timer.elapsed().as_secs_f64());
        response
    }

    /// List of requests to a single service: deduplicated, cache-checked
    /// per unique request, the misses submitted as one batch payload.
    pub fn get_service_list(
        &self,
        service_id: ServiceId,
        requests: &[String],
        token: &str,
        caching: bool,
    ) -> DispatchResponse {
        let timer = Instant::now();
        let error_block = || ServerBlock {
            service_id: Some(service_id),
            ..ServerBlock::ok(json!(requests))
        };

        if !self.engine.running() {
            tracing::info!(
                "{}: get_service_list: Server is not running service_id: {} num_requests: {}",
                token, service_id, requests.len()
            );
            return DispatchResponse::error(error_block(), NOT_RUNNING);
        }
        if !self.registry.contains(service_id) {
            tracing::info!(
                "{}: get_service_list: Invalid service ID service_id: {} num_requests: {}",
                token, service_id, requests.len()
            );
            return DispatchResponse::error(error_block(), "Invalid service_id");
        }
        if !self.auth.authorize_user(token, service_id) {
            tracing::info!(
                "{}: get_service_list: Insufficient permissions service_id: {} num_requests: {}",
                token, service_id, requests.len()
            );
            return DispatchResponse::error(error_block(), INSUFFICIENT_PERMISSIONS);
        }

        let Some((unique, positions)) = self.dedup(requests) else {
            tracing::info!(
                "{}: get_service_list: Request validation failed service_id: {} num_requests: {}",
                token, service_id, requests.len()
            );
            return DispatchResponse::error(error_block(), REQUEST_INVALID);
        };
        tracing::info!(
            "{}: get_service_list: Incoming request service_id: {} num_requests: {}",
            token, service_id, requests.len()
        );

        let name = self.registry.descriptor(service_id).expect("validated").name.clone();
        let mut response =
            DispatchResponse::new(ServerBlock::service(json!(requests), service_id, &name));

        // consult the cache per unique request, batch-submit the misses
        let mut unique_responses: Vec<Option<CachedResult>> = Vec::with_capacity(unique.len());
        let mut to_request: Vec<String> = Vec::new();
        for request in &unique {
            let cached = if caching {
                self.cache.get(service_id, request)
            } else {
                None
            };
            if cached.is_none() {
                to_request.push(request.clone());
            }
            unique_responses.push(cached);
        }

        let submitted = self
            .engine
            .submit(service_id, Payload::Many(to_request.clone()));

        let mut results: Vec<CachedResult> = Vec::new();
        if let Some(request_id) = submitted {
            let expect = Expect::Many(&to_request);
            let mut iter_count = 0u32;
            let mut backoff = 0u32;
            loop {
                let found = self
                    .drain_tmp(service_id, request_id, expect)
                    .or_else(|| self.poll_output(service_id, request_id, expect));
                if let Some(found) = found {
                    results = match found {
                        Correlated::Many(entries) => entries,
                        Correlated::One(entry) => vec![entry],
                    };
                    break;
                }

                iter_count += 1;
                if iter_count >= GET_ITER {
                    iter_count = 0;
                    if !self.engine.is_pending(service_id, request_id) {
                        tracing::error!(
                            "{}: get_service_list: Request returned incomplete due to no longer pending request_id: {} service_id: {}",
                            token,
                            request_id,
                            service_id
                        );
                        response.server = response.server.fail(INCOMPLETE_MANY);
                        break;
                    }
                    backoff_sleep(&mut backoff);
                }
            }
            self.engine.gc_done(service_id, request_id);
        }

        let expanded = expand(&positions, &mut unique_responses, &results);
        response.outputs.insert(name, Value::Array(expanded));
        response.server = response.server.timed(timer.elapsed().as_secs_f64());
        response
    }

    /// List of requests fanned out to a group: the combinatorial form.
    pub fn get_group_list(
        &self,
        group: &str,
        requests: &[String],
        token: &str,
        caching: bool,
    ) -> DispatchResponse {
        let timer = Instant::now();
        let error_block = || ServerBlock::group(json!(requests), group);

        if !self.engine.running() {
            tracing::info!(
                "{}: get_group_list: Server is not running group: {} num_requests: {}",
                token, group, requests.len()
            );
            return DispatchResponse::error(error_block(), NOT_RUNNING);
        }
        if let Ok(service_id) = group.parse::<ServiceId>() {
            return self.get_service_list(service_id, requests, token, caching);
        }

        let members = self
            .registry
            .resolve_group(group, self.config.key_sensitivity);
        if members.is_empty() {
            tracing::info!("{}: get_group_list: Invalid group name group: {}", token, group);
            return DispatchResponse::error(
                error_block(),
                format!("Group name '{}' is not implemented or is invalid", group),
            );
        }
        let authorized = self
            .auth
            .filter_authorized(token, &members.iter().map(|(id, _)| *id).collect::<Vec<_>>());
        let members: Vec<_> = members
            .into_iter()
            .filter(|(id, _)| authorized.contains(id))
            .collect();
        if members.is_empty() {
            tracing::info!(
                "{}: get_group_list: Insufficient permissions group: {}",
                token, group
            );
            return DispatchResponse::error(error_block(), INSUFFICIENT_PERMISSIONS);
        }

        let Some((unique, positions)) = self.dedup(requests) else {
            tracing::info!(
                "{}: get_group_list: Request validation failed group: {} num_requests: {}",
                token, group, requests.len()
            );
            return DispatchResponse::error(error_block(), REQUEST_INVALID);
        };
        tracing::info!(
            "{}: get_group_list: Incoming request group: {} num_requests: {}",
            token, group, requests.len()
        );

        let mut response = DispatchResponse::new(ServerBlock {
            service_ids: Some(members.iter().map(|(id, _)| *id).collect()),
            service_names: Some(members.iter().map(|(_, name)| name.clone()).collect()),
            ..ServerBlock::group(json!(requests), group)
        });

        let count = members.len();
        let mut unique_responses: Vec<Vec<Option<CachedResult>>> = Vec::with_capacity(count);
        let mut to_request: Vec<Vec<String>> = Vec::with_capacity(count);
        let mut submitted: Vec<Option<RequestId>> = Vec::with_capacity(count);
        let mut done = vec![false; count];
        let mut remaining = 0usize;

        for (service_id, _) in &members {
            let mut per_unique = Vec::with_capacity(unique.len());
            let mut misses = Vec::new();
            for request in &unique {
                let cached = if caching {
                    self.cache.get(*service_id, request)
                } else {
                    None
                };
                if cached.is_none() {
                    misses.push(request.clone());
                }
                per_unique.push(cached);
            }
            let request_id = self
                .engine
                .submit(*service_id, Payload::Many(misses.clone()));
            unique_responses.push(per_unique);
            to_request.push(misses);
            submitted.push(request_id);
        }
        for (index, request_id) in submitted.iter().enumerate() {
            if request_id.is_none() {
                // every request was already cached for this service
                done[index] = true;
            } else {
                remaining += 1;
            }
        }

        let mut results: Vec<Vec<CachedResult>> = vec![Vec::new(); count];
        let mut iter_count = 0u32;
        let mut backoff = 0u32;
        while remaining > 0 {
            for (index, (service_id, _)) in members.iter().enumerate() {
                if done[index] {
                    continue;
                }
                let request_id = submitted[index].expect("tracked as remaining");
                let expect = Expect::Many(&to_request[index]);

                let found = self
                    .drain_tmp(*service_id, request_id, expect)
                    .or_else(|| self.poll_output(*service_id, request_id, expect));
                if let Some(found) = found {
                    results[index] = match found {
                        Correlated::Many(entries) => entries,
                        Correlated::One(entry) => vec![entry],
                    };
                    done[index] = true;
                    remaining -= 1;
                }
            }

            iter_count += 1;
            if iter_count >= GET_ITER {
                iter_count = 0;
                let still_pending = members.iter().enumerate().any(|(index, (service_id, _))| {
                    !done[index]
                        && submitted[index]
                            .map(|request_id| self.engine.is_pending(*service_id, request_id))
                            .unwrap_or(false)
                });
                if !still_pending {
                    tracing::error!(
                        "{}: get_group_list: Request returned incomplete due to no longer pending group: {}",
                        token,
                        group
                    );
                    response.server = response.server.fail(INCOMPLETE_MANY);
                    break;
                }
                backoff_sleep(&mut backoff);
            }
        }

        for (index, (_, name)) in members.iter().enumerate() {
            let expanded = expand(&positions, &mut unique_responses[index], &results[index]);
            response.outputs.insert(name.clone(), Value::Array(expanded));
        }
        for (index, (service_id, _)) in members.iter().enumerate() {
            if let Some(request_id) = submitted[index] {
                self.engine.gc_done(*service_id, request_id);
            }
        }
        response.server = response.server.timed(timer.elapsed().as_secs_f64());
        response
    }

    // ======================= correlation plumbing ======================

    /// Validates every request and collapses duplicates. Returns the
    /// unique requests plus, per original position, the unique index.
    fn dedup(&self, requests: &[String]) -> Option<(Vec<String>, Vec<usize>)> {
        let mut unique: Vec<String> = Vec::new();
        let mut positions = Vec::with_capacity(requests.len());
        for request in requests {
            if !self.validate_request(request) {
                return None;
            }
            match unique.iter().position(|seen| seen == request) {
                Some(index) => positions.push(index),
                None => {
                    unique.push(request.clone());
                    positions.push(unique.len() - 1);
                }
            }
        }
        Some((unique, positions))
    }

    /// Non-blocking scan of the per-service tmp queue for our id. Every
    /// miss bumps the entry's retry count; entries over the limit are
    /// written straight to the cache from the pending ledger so that
    /// coalesced callers can pick them up.
    fn drain_tmp(
        &self,
        service_id: ServiceId,
        request_id: RequestId,
        expect: Expect<'_>,
    ) -> Option<Correlated> {
        let mut kept: Vec<TmpEntry> = Vec::new();
        let mut found = None;

        for _ in 0..TMP_ITER {
            let entry = self.tmp[service_id.index()].lock().unwrap().pop_front();
            let Some(mut entry) = entry else { break };
            entry.retries += 1;
            if entry.retries >= TMP_MAX_RETRIES {
                self.resolve_stray(service_id, entry);
                continue;
            }
            if entry.id == request_id {
                found = Some(self.store(service_id, expect, entry.output));
                break;
            }
            kept.push(entry);
        }

        let mut queue = self.tmp[service_id.index()].lock().unwrap();
        for entry in kept {
            queue.push_back(entry);
        }
        drop(queue);

        if found.is_some() {
            tracing::debug!(
                "Dispatcher: result for request_id: {}, service_id: {} found in tmp queue",
                request_id,
                service_id
            );
        }
        found
    }

    /// One blocking receive from the service output channel. A response
    /// for someone else is parked on the tmp queue.
    fn poll_output(
        &self,
        service_id: ServiceId,
        request_id: RequestId,
        expect: Expect<'_>,
    ) -> Option<Correlated> {
        let (id, output) = self.engine.recv_result(service_id, GET_TIMEOUT)?;
        if id == request_id {
            tracing::debug!(
                "Dispatcher: result for request_id: {}, service_id: {} found on output channel",
                request_id,
                service_id
            );
            Some(self.store(service_id, expect, output))
        } else {
            self.tmp[service_id.index()]
                .lock()
                .unwrap()
                .push_back(TmpEntry {
                    retries: 0,
                    id,
                    output,
                });
            None
        }
    }

    /// Caches outputs under their request strings and returns the stored
    /// entries in caller shape.
    fn store(&self, service_id: ServiceId, expect: Expect<'_>, output: Output) -> Correlated {
        match (expect, output) {
            (Expect::One(request), Output::One(value)) => {
                Correlated::One(self.cache.save(service_id, request, value))
            }
            (Expect::Many(requests), Output::Many(values)) => Correlated::Many(
                requests
                    .iter()
                    .zip(values)
                    .map(|(request, value)| self.cache.save(service_id, request, value))
                    .collect(),
            ),
            // ids pair payloads with outputs, so shapes always agree;
            // tolerate a mismatch by caching nothing
            (Expect::One(request), Output::Many(mut values)) => {
                tracing::error!(
                    "Dispatcher: batch output for single request: {} service_id: {}",
                    request,
                    service_id
                );
                let value = values.pop().unwrap_or(Value::Null);
                Correlated::One(self.cache.save(service_id, request, value))
            }
            (Expect::Many(requests), Output::One(value)) => {
                tracing::error!(
                    "Dispatcher: single output for batch request, service_id: {}",
                    service_id
                );
                Correlated::Many(
                    requests
                        .iter()
                        .map(|request| self.cache.save(service_id, request, value.clone()))
                        .collect(),
                )
            }
        }
    }

    /// A stray response aged out of the tmp queue: recover its original
    /// payload from the pending ledger and cache the outputs for whoever
    /// coalesced onto the same request. When the ledger entry is already
    /// gone the original request is unknowable and the result is dropped.
    fn resolve_stray(&self, service_id: ServiceId, entry: TmpEntry) {
        let payload = match self.engine.ledger(service_id).get(&entry.id.raw()) {
            Some(pending) => pending.payload.clone(),
            None => {
                tracing::debug!(
                    "Dispatcher: no pending entry for request_id: {} while resolving tmp queue, result dropped",
                    entry.id
                );
                return;
            }
        };
        match (payload, entry.output) {
            (Payload::One(request), Output::One(value)) => {
                self.cache.save(service_id, &request, value);
            }
            (Payload::Many(requests), Output::Many(values)) => {
                for (request, value) in requests.iter().zip(values) {
                    self.cache.save(service_id, request, value);
                }
            }
            _ => {
                tracing::error!(
                    "Dispatcher: payload/output shape mismatch for request_id: {} while resolving tmp queue",
                    entry.id
                );
            }
        }
    }
}

/// Bounded exponential back-off applied between pending-ledger checks:
/// 15ms doubling up to half a second.
fn backoff_sleep(count: &mut u32) {
    let millis = 15u64.saturating_mul(1 << (*count).min(6)).min(500);
    *count += 1;
    std::thread::sleep(Duration::from_millis(millis));
}

fn to_json(entry: &CachedResult) -> Value {
    serde_json::to_value(entry).expect("cached results are plain json")
}

fn correlated_to_json(found: Correlated) -> Value {
    match found {
        Correlated::One(entry) => to_json(&entry),
        Correlated::Many(entries) => Value::Array(entries.iter().map(to_json).collect()),
    }
}

/// Re-expands unique-request results to the original positions. Consumes
/// `results` in first-occurrence order; positions left unanswered (after
/// an incomplete run) become JSON null.
fn expand(
    positions: &[usize],
    unique_responses: &mut [Option<CachedResult>],
    results: &[CachedResult],
) -> Vec<Value> {
    let mut cursor = 0usize;
    let mut expanded = Vec::with_capacity(positions.len());
    for &unique_index in positions {
        if unique_responses[unique_index].is_none() && cursor < results.len() {
            unique_responses[unique_index] = Some(results[cursor].clone());
            cursor += 1;
        }
        expanded.push(
            unique_responses[unique_index]
                .as_ref()
                .map(to_json)
                .unwrap_or(Value::Null),
        );
    }
    expanded
}
