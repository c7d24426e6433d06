mod common;

use common::{dispatcher_with, FlakyService, RecordingService};
use fanout_types::{DispatchState, ServiceId, ServiceSpec};
use serde_json::json;

#[test]
fn identical_requests_hit_the_cache() {
    let config = common::fast_config();
    let service = RecordingService::new("echo");
    let dispatcher = dispatcher_with(vec![service.clone()], &config);

    let first = dispatcher.get_service(ServiceId::new(0), "abc", "", true);
    assert_eq!(first.server.state, DispatchState::Ok);
    assert_eq!(first.outputs["echo"]["output"], json!({"echo": "abc"}));
    assert!(first.server.response.unwrap() >= 0.0);

    let second = dispatcher.get_service(ServiceId::new(0), "abc", "", true);
    assert_eq!(second.outputs["echo"]["output"], json!({"echo": "abc"}));
    // served from the cache: the stored timestamp is identical and the
    // worker never saw a second request
    assert_eq!(
        first.outputs["echo"]["timestamp"],
        second.outputs["echo"]["timestamp"]
    );
    assert_eq!(service.call_count(), 1);

    dispatcher.shutdown();
}

#[test]
fn caching_false_reaches_the_worker_again() {
    let config = common::fast_config();
    let service = RecordingService::new("echo");
    let dispatcher = dispatcher_with(vec![service.clone()], &config);

    dispatcher.get_service(ServiceId::new(0), "abc", "", true);
    let response = dispatcher.get_service(ServiceId::new(0), "abc", "", false);
    assert_eq!(response.server.state, DispatchState::Ok);

    // the resubmission may still be in flight when the caller is served
    // out of the coalescing cache, so give the worker a moment
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while service.call_count() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(service.call_count(), 2);

    dispatcher.shutdown();
}

#[test]
fn list_requests_are_deduplicated() {
    let config = common::fast_config();
    let service = RecordingService::new("echo");
    let dispatcher = dispatcher_with(vec![service.clone()], &config);

    let requests = vec!["x".to_string(), "y".to_string(), "x".to_string()];
    let response = dispatcher.get_service_list(ServiceId::new(0), &requests, "", true);

    assert_eq!(response.server.state, DispatchState::Ok);
    let outputs = response.outputs["echo"].as_array().unwrap();
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0], outputs[2]);
    assert_eq!(outputs[1]["output"], json!({"echo": "y"}));

    // the worker pool received exactly the two distinct requests
    assert_eq!(service.call_count(), 2);

    dispatcher.shutdown();
}

#[test]
fn group_fans_out_to_every_member() {
    let config = common::fast_config();
    let a = RecordingService::with_spec(ServiceSpec {
        name: "a".into(),
        groups: vec!["g".into()],
        ..ServiceSpec::default()
    });
    let b = RecordingService::with_spec(ServiceSpec {
        name: "b".into(),
        groups: vec!["g".into()],
        ..ServiceSpec::default()
    });
    let dispatcher = dispatcher_with(vec![a, b], &config);

    let response = dispatcher.get_group("g", "foo", "", true);
    assert_eq!(response.server.state, DispatchState::Ok);
    assert_eq!(
        response.server.service_ids,
        Some(vec![ServiceId::new(0), ServiceId::new(1)])
    );
    assert_eq!(response.outputs["a"]["output"], json!({"echo": "foo"}));
    assert_eq!(response.outputs["b"]["output"], json!({"echo": "foo"}));

    dispatcher.shutdown();
}

#[test]
fn group_list_builds_the_result_matrix() {
    let config = common::fast_config();
    let a = RecordingService::with_spec(ServiceSpec {
        name: "a".into(),
        groups: vec!["g".into()],
        ..ServiceSpec::default()
    });
    let b = RecordingService::with_spec(ServiceSpec {
        name: "b".into(),
        groups: vec!["g".into()],
        ..ServiceSpec::default()
    });
    let dispatcher = dispatcher_with(vec![a, b], &config);

    let requests = vec!["p".to_string(), "q".to_string(), "p".to_string()];
    let response = dispatcher.get_group_list("g", &requests, "", true);
    assert_eq!(response.server.state, DispatchState::Ok);
    for name in ["a", "b"] {
        let outputs = response.outputs[name].as_array().unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0], outputs[2]);
    }

    dispatcher.shutdown();
}

#[test]
fn digit_group_names_route_to_the_service() {
    let config = common::fast_config();
    let dispatcher = dispatcher_with(vec![RecordingService::new("echo")], &config);

    let response = dispatcher.get_group("0", "abc", "", true);
    assert_eq!(response.server.service_id, Some(ServiceId::new(0)));
    assert_eq!(response.outputs["echo"]["output"], json!({"echo": "abc"}));

    let unknown = dispatcher.get_group("7", "abc", "", true);
    assert_eq!(unknown.server.state, DispatchState::Error);
    assert_eq!(unknown.server.message.as_deref(), Some("Invalid service_id"));

    let invalid = dispatcher.get_group("nope", "abc", "", true);
    assert_eq!(
        invalid.server.message.as_deref(),
        Some("Group name 'nope' is not implemented or is invalid")
    );

    dispatcher.shutdown();
}

#[test]
fn oversized_requests_fail_validation() {
    let config = common::fast_config();
    let dispatcher = dispatcher_with(vec![RecordingService::new("echo")], &config);

    let oversized = "x".repeat(config.max_message_size + 1);
    let response = dispatcher.get_service(ServiceId::new(0), &oversized, "", true);
    assert_eq!(response.server.state, DispatchState::Error);
    assert_eq!(
        response.server.message.as_deref(),
        Some("Request validation failed")
    );

    dispatcher.shutdown();
}

#[test]
fn service_errors_are_captured_per_request() {
    let config = common::fast_config();
    let dispatcher = dispatcher_with(vec![FlakyService::new("flaky")], &config);

    let failed = dispatcher.get_service(ServiceId::new(0), "bad", "", true);
    assert_eq!(failed.server.state, DispatchState::Ok);
    assert_eq!(
        failed.outputs["flaky"]["output"],
        json!({"server": "Service raised exception", "exception": "boom"})
    );

    // one bad input does not poison the pool
    let ok = dispatcher.get_service(ServiceId::new(0), "good", "", true);
    assert_eq!(ok.outputs["flaky"]["output"], json!({"ok": "good"}));

    dispatcher.shutdown();
}

#[test]
fn stopped_server_rejects_dispatch() {
    let config = common::fast_config();
    let dispatcher = dispatcher_with(vec![RecordingService::new("echo")], &config);

    assert!(dispatcher.stop_services());
    let response = dispatcher.get_service(ServiceId::new(0), "abc", "", true);
    assert_eq!(response.server.state, DispatchState::Error);
    assert_eq!(
        response.server.message.as_deref(),
        Some("Server is not running")
    );

    // start is idempotent and brings dispatch back
    assert!(dispatcher.start_services());
    assert!(!dispatcher.start_services());
    let response = dispatcher.get_service(ServiceId::new(0), "abc", "", true);
    assert_eq!(response.server.state, DispatchState::Ok);

    dispatcher.shutdown();
}

mod authorization {
    use super::*;
    use fanout::auth::AuthManager;
    use fanout::registry::Registry;
    use fanout::dispatcher::Dispatcher;
    use fanout_types::TokensFile;
    use std::sync::Arc;

    const USER: &str = "usertoken1234";

    #[test]
    fn tokens_gate_services_individually() {
        utils::init_tracing_tests();
        let config = fanout::config::Config {
            terminator_idle_cycle: 0.1,
            th_proc_response_time: 0.1,
            ..fanout::config::Config::default()
        };

        let registry = Arc::new(
            Registry::new(
                vec![
                    RecordingService::new("zero"),
                    RecordingService::new("one"),
                ],
                &config,
            )
            .unwrap(),
        );
        let tokens: TokensFile = serde_json::from_value(json!({
            "groups": {},
            "users": { USER: [0] },
            "superusers": [],
            "admins": []
        }))
        .unwrap();
        let auth = AuthManager::from_tokens(tokens, &config.token_regex, false, false).unwrap();
        let dispatcher = Arc::new(Dispatcher::with_auth(registry, &config, auth).unwrap());

        let denied = dispatcher.get_service(ServiceId::new(1), "x", USER, true);
        assert_eq!(denied.server.state, DispatchState::Error);
        assert_eq!(
            denied.server.message.as_deref(),
            Some("Insufficient permissions")
        );

        let allowed = dispatcher.get_service(ServiceId::new(0), "x", USER, true);
        assert_eq!(allowed.server.state, DispatchState::Ok);

        // unknown tokens see nothing
        let unknown = dispatcher.get_service(ServiceId::new(0), "x", "stranger99999", true);
        assert_eq!(unknown.server.state, DispatchState::Error);

        dispatcher.shutdown();
    }

    #[test]
    fn group_calls_filter_unauthorized_members() {
        utils::init_tracing_tests();
        let config = fanout::config::Config {
            terminator_idle_cycle: 0.1,
            th_proc_response_time: 0.1,
            ..fanout::config::Config::default()
        };

        let zero = RecordingService::with_spec(ServiceSpec {
            name: "zero".into(),
            groups: vec!["g".into()],
            ..ServiceSpec::default()
        });
        let one = RecordingService::with_spec(ServiceSpec {
            name: "one".into(),
            groups: vec!["g".into()],
            ..ServiceSpec::default()
        });
        let registry = Arc::new(Registry::new(vec![zero, one.clone()], &config).unwrap());
        let tokens: TokensFile = serde_json::from_value(json!({
            "groups": {},
            "users": { USER: [0] },
            "superusers": [],
            "admins": []
        }))
        .unwrap();
        let auth = AuthManager::from_tokens(tokens, &config.token_regex, false, false).unwrap();
        let dispatcher = Arc::new(Dispatcher::with_auth(registry, &config, auth).unwrap());

        let response = dispatcher.get_group("g", "foo", USER, true);
        assert_eq!(response.server.state, DispatchState::Ok);
        assert_eq!(response.server.service_ids, Some(vec![ServiceId::new(0)]));
        assert!(response.outputs.contains_key("zero"));
        assert!(!response.outputs.contains_key("one"));
        assert_eq!(one.call_count(), 0);

        dispatcher.shutdown();
    }
}
