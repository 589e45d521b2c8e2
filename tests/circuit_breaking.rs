//! Instance and subset breakers driven through the consumer API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use polaris_client::circuit_breaker::set::LocalMetricsBackend;
use polaris_client::config::loader::parse_config;
use polaris_client::config::PolarisConfig;
use polaris_client::model::{CallResult, CallRetStatus, CircuitBreakerStatus, ServiceKey};
use polaris_client::{ConsumerApi, InstanceRequest};

use common::{api, api_from_config, manual_clock, map, service_key, weighted_instances, ScriptedBackend};

fn error_count_config() -> PolarisConfig {
    let mut config = PolarisConfig::default();
    let breaker = &mut config.consumer.circuit_breaker;
    breaker.chain = vec!["errorCount".to_string()];
    breaker.error_count.continuous_error_threshold = 5;
    breaker.error_count.sleep_window = Duration::from_secs(10);
    breaker.error_count.request_count_after_half_open = 3;
    breaker.error_count.success_count_after_half_open = 3;
    config
}

fn report(api: &ConsumerApi, id: &str, status: CallRetStatus, times: usize) {
    for _ in 0..times {
        api.update_call_result(&CallResult::new(service_key(), id, status)).unwrap();
    }
}

fn instance_ids(api: &ConsumerApi) -> Vec<String> {
    let mut ids: Vec<String> = api
        .get_instances(&InstanceRequest::new(service_key()))
        .unwrap()
        .instances
        .iter()
        .map(|i| i.id.clone())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_error_count_full_cycle() {
    let (api, clock) = api(error_count_config(), weighted_instances(&[100, 100, 100]));
    let executor = api.context().executor().clone();

    report(&api, "inst-0", CallRetStatus::Error, 4);
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::Close);
    report(&api, "inst-0", CallRetStatus::Error, 1);
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::Open);
    assert_eq!(instance_ids(&api), vec!["inst-1", "inst-2"]);

    // still open inside the sleep window
    clock.advance_ms(5_000);
    executor.timing_once();
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::Open);

    clock.advance_ms(5_000);
    executor.timing_once();
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::HalfOpen);

    // the half-open instance takes its trial requests first
    for _ in 0..3 {
        let chosen = api.get_one_instance(&InstanceRequest::new(service_key())).unwrap();
        assert_eq!(chosen.id, "inst-0");
    }
    report(&api, "inst-0", CallRetStatus::Ok, 3);

    clock.advance_ms(1_000);
    executor.timing_once();
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::Close);
    assert_eq!(instance_ids(&api), vec!["inst-0", "inst-1", "inst-2"]);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let (api, clock) = api(error_count_config(), weighted_instances(&[100, 100]));
    let executor = api.context().executor().clone();
    report(&api, "inst-1", CallRetStatus::Error, 5);
    clock.advance_ms(10_000);
    executor.timing_once();
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-1"), CircuitBreakerStatus::HalfOpen);

    // 3 requests, 3 successes needed: a single error reopens
    report(&api, "inst-1", CallRetStatus::Error, 1);
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-1"), CircuitBreakerStatus::Open);
}

#[tokio::test]
async fn test_configured_half_open_error_count_reopens_earlier() {
    let config = parse_config(
        r#"
        [consumer.circuitBreaker]
        chain = ["errorCount"]
        [consumer.circuitBreaker.errorCount]
        continuousErrorThreshold = 5
        sleepWindow = "10s"
        requestCountAfterHalfOpen = 5
        successCountAfterHalfOpen = 2
        errorCountAfterHalfOpen = 2
        "#,
    )
    .unwrap();
    let (api, clock) = api(config, weighted_instances(&[100, 100]));
    let executor = api.context().executor().clone();
    report(&api, "inst-1", CallRetStatus::Error, 5);
    clock.advance_ms(10_000);
    executor.timing_once();
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-1"), CircuitBreakerStatus::HalfOpen);

    // without the override 4 half-open errors would be tolerated
    report(&api, "inst-1", CallRetStatus::Error, 1);
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-1"), CircuitBreakerStatus::HalfOpen);
    report(&api, "inst-1", CallRetStatus::Error, 1);
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-1"), CircuitBreakerStatus::Open);
}

#[test]
fn test_open_instance_skipped_without_narrowing_router() {
    let mut config = error_count_config();
    config.consumer.service_router.chain = vec!["ruleBasedRouter".to_string()];
    let (api, _) = api(config, weighted_instances(&[100, 100, 100]));
    report(&api, "inst-0", CallRetStatus::Error, 5);
    assert_eq!(instance_ids(&api), vec!["inst-1", "inst-2"]);
    for _ in 0..50 {
        assert_ne!(api.get_one_instance(&InstanceRequest::new(service_key())).unwrap().id, "inst-0");
    }
}

#[test]
fn test_open_instance_skipped_with_nearby_disabled() {
    let (api, _) = api(error_count_config(), weighted_instances(&[100, 100]));
    report(&api, "inst-1", CallRetStatus::Error, 5);
    let mut request = InstanceRequest::new(service_key());
    request.disable_nearby = true;
    for _ in 0..50 {
        assert_eq!(api.get_one_instance(&request).unwrap().id, "inst-0");
    }
}

#[tokio::test]
async fn test_success_resets_error_streak() {
    let (api, _) = api(error_count_config(), weighted_instances(&[100, 100]));
    for _ in 0..3 {
        report(&api, "inst-0", CallRetStatus::Error, 4);
        report(&api, "inst-0", CallRetStatus::Ok, 1);
    }
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::Close);
}

#[test]
fn test_disabled_breaker_ignores_results() {
    let mut config = error_count_config();
    config.consumer.circuit_breaker.enable = false;
    let (api, _) = api(config, weighted_instances(&[100]));
    report(&api, "inst-0", CallRetStatus::Error, 20);
    assert_eq!(api.get_circuit_breaker_status(&service_key(), "inst-0"), CircuitBreakerStatus::Close);
}

const SET_CONFIG: &str = r#"
    [consumer.circuitBreaker]
    chain = ["errorCount"]

    [consumer.serviceRouter]
    chain = ["ruleBasedRouter"]

    [[services]]
    namespace = "Test"
    name = "sets"
    [[services.instances]]
    id = "a"
    host = "10.0.0.1"
    port = 80
    metadata = { set = "s1" }
    [[services.instances]]
    id = "b"
    host = "10.0.0.2"
    port = 80
    metadata = { set = "s2" }

    [[services.routeRule.inbounds]]
    destinations = [
        { metadata = { set = { value = "s1" } }, priority = 0 },
        { metadata = { set = { value = "s2" } }, priority = 1 },
    ]

    [services.circuitBreaker]
    id = "cb"
    [[services.circuitBreaker.inbounds]]
    sources = [{}]
    destinations = [{ metadata = { set = { value = "s1" } }, recover = { sleepWindowMs = 60000 } }]
"#;

fn sets_key() -> ServiceKey {
    ServiceKey::new("Test", "sets")
}

fn subset_errors(api: &ConsumerApi, times: usize) {
    for _ in 0..times {
        let mut result = CallResult::new(sets_key(), "", CallRetStatus::Error);
        result.subset = map(&[("set", "s1")]);
        api.update_call_result(&result).unwrap();
    }
}

fn routed_ids(api: &ConsumerApi) -> Vec<String> {
    api.get_instances(&InstanceRequest::new(sets_key()))
        .unwrap()
        .instances
        .iter()
        .map(|i| i.id.clone())
        .collect()
}

#[tokio::test]
async fn test_open_subset_is_routed_around() {
    let clock = manual_clock();
    let backend = Arc::new(LocalMetricsBackend::new(clock.clone()));
    let api = api_from_config(parse_config(SET_CONFIG).unwrap(), clock.clone(), backend);
    assert_eq!(routed_ids(&api), vec!["a"]);

    subset_errors(&api, 10);
    // counts are only judged once the report interval passed
    assert_eq!(routed_ids(&api), vec!["a"]);

    clock.advance_ms(5_000);
    api.context().executor().report_once().await;
    let chain = api.context().executor().get_chain(&sets_key()).unwrap();
    let info = chain.set_breaker().unwrap().status("set:s1#").unwrap();
    assert_eq!(info.status, CircuitBreakerStatus::Open);

    let response = api.get_instances(&InstanceRequest::new(sets_key())).unwrap();
    assert_eq!(response.subset, map(&[("set", "s2")]));
    assert_eq!(routed_ids(&api), vec!["b"]);
}

#[tokio::test]
async fn test_subset_report_retried_on_server_error() {
    let clock = manual_clock();
    let backend = Arc::new(ScriptedBackend::new(clock.clone(), 2));
    let api = api_from_config(parse_config(SET_CONFIG).unwrap(), clock.clone(), backend.clone());

    subset_errors(&api, 10);
    clock.advance_ms(5_000);
    api.context().executor().report_once().await;

    assert_eq!(backend.reports(), 3);
    let chain = api.context().executor().get_chain(&sets_key()).unwrap();
    assert_eq!(
        chain.set_breaker().unwrap().status("set:s1#").map(|i| i.status),
        Some(CircuitBreakerStatus::Open)
    );
}

#[tokio::test]
async fn test_instance_timing_not_held_up_by_failing_backend() {
    let clock = manual_clock();
    let backend = Arc::new(ScriptedBackend::new(clock.clone(), 10));
    let api = api_from_config(parse_config(SET_CONFIG).unwrap(), clock.clone(), backend.clone());
    let executor = api.context().executor().clone();

    subset_errors(&api, 10);
    for _ in 0..10 {
        api.update_call_result(&CallResult::new(sets_key(), "a", CallRetStatus::Error)).unwrap();
    }
    assert_eq!(api.get_circuit_breaker_status(&sets_key(), "a"), CircuitBreakerStatus::Open);
    clock.advance_ms(30_000);

    let reports = tokio::spawn({
        let executor = executor.clone();
        async move { executor.report_once().await }
    });
    // let the report pass hit its first failure and back off
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    executor.timing_once();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(api.get_circuit_breaker_status(&sets_key(), "a"), CircuitBreakerStatus::HalfOpen);
    assert!(!reports.is_finished());

    assert_eq!(reports.await.unwrap(), 1);
    assert_eq!(backend.reports(), 3);
}

#[tokio::test]
async fn test_subset_report_given_up_after_retries() {
    let clock = manual_clock();
    let backend = Arc::new(ScriptedBackend::new(clock.clone(), 10));
    let api = api_from_config(parse_config(SET_CONFIG).unwrap(), clock.clone(), backend.clone());

    subset_errors(&api, 10);
    clock.advance_ms(5_000);
    api.context().executor().report_once().await;

    assert_eq!(backend.reports(), 3);
    // nothing reached the backend, so nothing was judged
    assert_eq!(routed_ids(&api), vec!["a"]);
}
