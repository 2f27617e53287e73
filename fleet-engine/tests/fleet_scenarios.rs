// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end fleet scenarios against the scripted provider
//!
//! All tests run under tokio's paused clock, so poll intervals, stagger
//! delays and timeouts elapse virtually and the suite runs in
//! milliseconds of real time.

use chrono::Utc;
use fleet_common::config::OperationKind;
use fleet_common::config::RunConfig;
use fleet_common::instance::InstanceState;
use fleet_common::report::CheckVerdict;
use fleet_common::report::FleetReport;
use fleet_common::report::OperationStatus;
use fleet_common::Error;
use fleet_common::ErrorKind;
use fleet_engine::clock;
use fleet_engine::run;
use fleet_engine::SystemClock;
use fleet_test_utils::log::test_logger;
use fleet_test_utils::sim::SimFleet;
use fleet_test_utils::sim::SimInstance;
use fleet_test_utils::sim::METHOD_BEGIN_UPGRADE;
use fleet_test_utils::sim::METHOD_LIST;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const PROJECT: &str = "p";

fn upgrade_config() -> RunConfig {
    let mut cfg = RunConfig::new(
        OperationKind::Upgrade,
        PROJECT,
        vec!["zone-a".to_string(), "zone-b".to_string()],
    );
    cfg.max_parallel = 2;
    cfg.stagger_delay_secs = 0.0;
    cfg
}

fn rollback_config() -> RunConfig {
    let mut cfg = upgrade_config();
    cfg.operation = OperationKind::Rollback;
    cfg
}

/// The shared four-instance fleet: an upgradable instance, an up-to-date
/// one, a stopped upgradable one, and a previously-upgraded one.
fn shared_fleet() -> SimFleet {
    let sim = SimFleet::new(PROJECT);
    let two_days_ago = Utc::now() - chrono::Duration::days(2);
    sim.add_instance(
        SimInstance::new("i1", "zone-a")
            .version("2.0.0")
            .upgrade_available("2.1.0")
            .previous_version("1.9.0")
            .last_upgrade_at(two_days_ago),
    );
    sim.add_instance(SimInstance::new("i2", "zone-a").version("2.1.0"));
    sim.add_instance(
        SimInstance::new("i3", "zone-b")
            .state(InstanceState::Stopped)
            .version("2.0.0")
            .upgrade_available("2.1.0")
            .previous_version("1.9.0")
            .last_upgrade_at(two_days_ago),
    );
    sim.add_instance(
        SimInstance::new("i4", "zone-b")
            .version("2.1.0")
            .previous_version("2.0.0")
            .last_upgrade_at(two_days_ago),
    );
    sim
}

async fn run_fleet(cfg: &RunConfig, sim: &SimFleet) -> FleetReport {
    run(
        cfg,
        Arc::new(sim.clone()),
        Arc::new(SystemClock),
        &test_logger("fleet_scenarios"),
        clock::never_cancelled(),
    )
    .await
    .expect("validated config must produce a report")
}

fn statuses(report: &FleetReport) -> Vec<(&str, OperationStatus)> {
    report
        .results
        .iter()
        .map(|result| (result.instance.as_str(), result.status))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_dry_run_fleet() {
    let sim = shared_fleet();
    let mut cfg = upgrade_config();
    cfg.dry_run = true;

    let report = run_fleet(&cfg, &sim).await;

    assert_eq!(
        statuses(&report),
        vec![
            ("i1", OperationStatus::DryRun),
            ("i2", OperationStatus::UpToDate),
            ("i3", OperationStatus::DryRun),
            ("i4", OperationStatus::UpToDate),
        ]
    );
    let i1 = &report.results[0];
    assert_eq!(i1.target_version.as_deref(), Some("2.1.0"));
    let i3 = &report.results[2];
    assert_eq!(i3.target_version.as_deref(), Some("2.1.0"));

    // Dry-run purity: not a single mutating call.
    assert!(sim.mutations().is_empty());

    let stats = &report.statistics;
    assert_eq!(stats.total, 4);
    assert_eq!(stats.eligible, 2);
    assert_eq!(stats.up_to_date, 2);
    assert_eq!(stats.started, 0);
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_with_autostart_and_compensation() {
    let sim = SimFleet::new(PROJECT);
    let two_days_ago = Utc::now() - chrono::Duration::days(2);
    sim.add_instance(
        SimInstance::new("i1", "zone-a")
            .version("2.0.0")
            .upgrade_available("2.1.0")
            .previous_version("1.9.0")
            .last_upgrade_at(two_days_ago)
            .fail_upgrade_with(Error::unexpected("image build failed")),
    );
    sim.add_instance(SimInstance::new("i2", "zone-a").version("2.1.0"));
    sim.add_instance(
        SimInstance::new("i3", "zone-b")
            .state(InstanceState::Stopped)
            .version("2.0.0")
            .upgrade_available("2.1.0"),
    );
    sim.add_instance(
        SimInstance::new("i4", "zone-b")
            .version("2.1.0")
            .previous_version("2.0.0")
            .last_upgrade_at(two_days_ago),
    );
    let mut cfg = upgrade_config();
    cfg.rollback_on_failure = true;

    let report = run_fleet(&cfg, &sim).await;

    assert_eq!(
        statuses(&report),
        vec![
            ("i1", OperationStatus::Compensated),
            ("i2", OperationStatus::UpToDate),
            ("i3", OperationStatus::Succeeded),
            ("i4", OperationStatus::UpToDate),
        ]
    );

    let i1 = &report.results[0];
    assert!(i1.compensated);
    assert_eq!(i1.operation, OperationKind::Upgrade);
    assert_eq!(i1.error_message.as_deref(), Some("unexpected error: image build failed"));

    // The stopped instance was started, then upgraded.
    let i3 = sim.snapshot_of("i3").unwrap();
    assert_eq!(i3.state, InstanceState::Active);
    assert_eq!(i3.current_version, "2.1.0");

    let stats = &report.statistics;
    assert_eq!(stats.compensated, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.up_to_date, 2);
    assert_eq!(stats.started, 2);
    assert_eq!(stats.total, 4);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_dry_run() {
    let sim = shared_fleet();
    let mut cfg = rollback_config();
    cfg.dry_run = true;

    let report = run_fleet(&cfg, &sim).await;

    assert_eq!(
        statuses(&report),
        vec![
            ("i1", OperationStatus::DryRun),
            ("i2", OperationStatus::Skipped),
            ("i3", OperationStatus::DryRun),
            ("i4", OperationStatus::DryRun),
        ]
    );

    // i4 is active with full history: all four checks pass.
    let i4 = &report.results[3];
    assert_eq!(i4.pre_checks.len(), 4);
    assert!(i4
        .pre_checks
        .iter()
        .all(|check| check.verdict == CheckVerdict::Pass));
    assert_eq!(i4.target_version.as_deref(), Some("2.0.0"));

    // i3 is stopped: the state check is skipped with the would-start
    // note, and the remaining checks ran against its metadata.
    let i3 = &report.results[2];
    assert_eq!(i3.pre_checks.len(), 4);
    assert_eq!(i3.pre_checks[0].verdict, CheckVerdict::Skipped);
    assert_eq!(i3.pre_checks[0].message, "would be started before rollback");
    assert!(i3.pre_checks[1..]
        .iter()
        .all(|check| check.verdict == CheckVerdict::Pass));

    // i2 never upgraded: ineligible, with the history check failing.
    let i2 = &report.results[1];
    assert_eq!(i2.error_kind, Some(ErrorKind::Ineligible));
    let history = i2
        .pre_checks
        .iter()
        .find(|check| check.name == "upgrade_history")
        .unwrap();
    assert_eq!(history.verdict, CheckVerdict::Fail);

    assert!(sim.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_upgrade_retries_then_succeeds() {
    let sim = shared_fleet();
    for _ in 0..4 {
        sim.inject_fault(
            METHOD_BEGIN_UPGRADE,
            "i1",
            Error::rate_limited("operation queue full"),
        );
    }
    let cfg = upgrade_config();
    let report = run_fleet(&cfg, &sim).await;

    let i1 = report
        .results
        .iter()
        .find(|result| result.instance == "i1")
        .unwrap();
    assert_eq!(i1.status, OperationStatus::Succeeded);

    // Four rejected attempts, one success.
    assert_eq!(
        sim.calls_to(METHOD_BEGIN_UPGRADE)
            .iter()
            .filter(|call| call.target == "i1")
            .count(),
        5
    );

    // The instance's duration covers at least the minimum backoff sum
    // (the policy randomizes down to 50% of each interval).
    assert!(i1.duration_seconds.unwrap() >= 120.0);

    // Nobody else's outcome changes.
    let i3 = report
        .results
        .iter()
        .find(|result| result.instance == "i3")
        .unwrap();
    assert_eq!(i3.status, OperationStatus::Succeeded);
    assert_eq!(
        report
            .results
            .iter()
            .filter(|result| result.status == OperationStatus::UpToDate)
            .count(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_queue_conflict_upgrade_retries_then_succeeds() {
    // A plain 409 from the provider is its operation queue pushing
    // back; the adapter surfaces it as RATE_LIMITED, so the tracker
    // keeps retrying with backoff instead of giving the instance up.
    let sim = shared_fleet();
    for _ in 0..4 {
        sim.inject_fault(
            METHOD_BEGIN_UPGRADE,
            "i1",
            Error::rate_limited("HTTP 409: operation queue full"),
        );
    }
    let cfg = upgrade_config();
    let report = run_fleet(&cfg, &sim).await;

    let i1 = report
        .results
        .iter()
        .find(|result| result.instance == "i1")
        .unwrap();
    assert_eq!(i1.status, OperationStatus::Succeeded);

    // Four queue rejections, then the begin goes through.
    assert_eq!(
        sim.calls_to(METHOD_BEGIN_UPGRADE)
            .iter()
            .filter(|call| call.target == "i1")
            .count(),
        5
    );
    assert!(i1.duration_seconds.unwrap() >= 120.0);

    // Nobody else's outcome changes.
    assert_eq!(report.statistics.succeeded, 2);
    assert_eq!(report.statistics.up_to_date, 2);
    assert_eq!(report.statistics.failed, 0);
    assert_eq!(report.statistics.skipped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_flight() {
    let sim = SimFleet::new(PROJECT);
    for index in 1..=4 {
        sim.add_instance(
            SimInstance::new(&format!("i{index}"), "zone-a")
                .version("2.0.0")
                .upgrade_available("2.1.0")
                .polls_to_complete(1000),
        );
    }
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.stagger_delay_secs = 3.0;

    let (cancel_tx, cancel_rx) = clock::cancel_channel();
    let run_task = {
        let cfg = cfg.clone();
        let sim = sim.clone();
        tokio::spawn(async move {
            run(
                &cfg,
                Arc::new(sim),
                Arc::new(SystemClock),
                &test_logger("cancellation"),
                cancel_rx,
            )
            .await
        })
    };

    // Let the first workers get their operations in flight, then pull
    // the plug.
    tokio::time::sleep(Duration::from_secs(61)).await;
    let cancelled_at = Instant::now();
    cancel_tx.send(true).expect("engine is listening");

    let report = run_task
        .await
        .expect("run task")
        .expect("report is produced even when cancelled");

    assert_eq!(report.results.len(), 4);
    for result in &report.results {
        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    }
    // The two in-flight trackers note that the provider-side outcome is
    // unknown.
    assert_eq!(
        report
            .results
            .iter()
            .filter(|result| {
                result
                    .error_message
                    .as_deref()
                    .is_some_and(|message| message.contains("UNKNOWN"))
            })
            .count(),
        2
    );

    // No mutations after the cancellation instant.
    assert!(sim.mutations().iter().all(|call| call.at <= cancelled_at));
    assert_eq!(report.statistics.failed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_parallelism_and_stagger_under_load() {
    let sim = SimFleet::new(PROJECT);
    for index in 1..=20 {
        sim.add_instance(
            SimInstance::new(&format!("i{index:02}"), "zone-a")
                .version("2.0.0")
                .upgrade_available("2.1.0")
                .polls_to_complete(2),
        );
    }
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.max_parallel = 3;
    cfg.stagger_delay_secs = 0.5;

    let report = run_fleet(&cfg, &sim).await;

    assert_eq!(report.results.len(), 20);
    assert!(report
        .results
        .iter()
        .all(|result| result.status == OperationStatus::Succeeded));

    // Never more than three operations in flight.
    assert!(sim.max_active_operations() <= 3);

    // Dispatches (observed as each worker's first provider call) are at
    // least the stagger apart.
    let mut dispatches: Vec<Instant> = sim
        .calls_to(fleet_test_utils::sim::METHOD_CHECK_UPGRADABLE)
        .iter()
        .map(|call| call.at)
        .collect();
    dispatches.sort();
    assert_eq!(dispatches.len(), 20);
    for pair in dispatches.windows(2) {
        assert!(
            pair[1] - pair[0] >= Duration::from_millis(500),
            "dispatches {:?} closer than the stagger",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_max_parallel_one_is_serial() {
    let sim = SimFleet::new(PROJECT);
    for index in 1..=3 {
        sim.add_instance(
            SimInstance::new(&format!("i{index}"), "zone-a")
                .version("2.0.0")
                .upgrade_available("2.1.0")
                .polls_to_complete(2),
        );
    }
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.max_parallel = 1;

    let report = run_fleet(&cfg, &sim).await;
    assert!(report
        .results
        .iter()
        .all(|result| result.status == OperationStatus::Succeeded));
    assert_eq!(sim.max_active_operations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_stagger_allows_same_instant_dispatch() {
    let sim = SimFleet::new(PROJECT);
    for index in 1..=3 {
        sim.add_instance(
            SimInstance::new(&format!("i{index}"), "zone-a")
                .version("2.0.0")
                .upgrade_available("2.1.0"),
        );
    }
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.max_parallel = 3;
    cfg.stagger_delay_secs = 0.0;

    run_fleet(&cfg, &sim).await;

    let dispatches: Vec<Instant> = sim
        .calls_to(fleet_test_utils::sim::METHOD_CHECK_UPGRADABLE)
        .iter()
        .map(|call| call.at)
        .collect();
    assert_eq!(dispatches.len(), 3);
    assert!(dispatches.iter().all(|at| *at == dispatches[0]));
}

#[tokio::test(start_paused = true)]
async fn test_empty_fleet_is_not_an_error() {
    let sim = SimFleet::new(PROJECT);
    let report = run_fleet(&upgrade_config(), &sim).await;
    assert!(report.results.is_empty());
    assert_eq!(report.statistics.total, 0);
    assert!(report.message.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_instance_filter_matches_one() {
    let sim = shared_fleet();
    let mut cfg = upgrade_config();
    cfg.instance = Some("i1".to_string());

    let report = run_fleet(&cfg, &sim).await;
    assert_eq!(statuses(&report), vec![("i1", OperationStatus::Succeeded)]);
}

#[tokio::test(start_paused = true)]
async fn test_instance_filter_matching_nothing() {
    let sim = shared_fleet();
    let mut cfg = upgrade_config();
    cfg.instance = Some("does-not-exist".to_string());

    let report = run_fleet(&cfg, &sim).await;
    assert!(report.results.is_empty());
    assert!(report
        .message
        .as_deref()
        .is_some_and(|message| message.contains("does-not-exist")));
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_rerun_is_idempotent() {
    let sim = shared_fleet();
    let cfg = upgrade_config();

    let first = run_fleet(&cfg, &sim).await;
    assert_eq!(first.statistics.succeeded, 2);

    let second = run_fleet(&cfg, &sim).await;
    assert_eq!(second.statistics.succeeded, 0);
    assert_eq!(second.statistics.up_to_date, second.statistics.total);
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_then_rollback_round_trip() {
    let sim = shared_fleet();

    let upgraded = run_fleet(&upgrade_config(), &sim).await;
    assert_eq!(upgraded.statistics.succeeded, 2);
    assert_eq!(sim.snapshot_of("i1").unwrap().current_version, "2.1.0");

    let rolled_back = run_fleet(&rollback_config(), &sim).await;
    let i1 = rolled_back
        .results
        .iter()
        .find(|result| result.instance == "i1")
        .unwrap();
    assert_eq!(i1.status, OperationStatus::Succeeded);
    assert_eq!(i1.target_version.as_deref(), Some("2.0.0"));
    assert_eq!(sim.snapshot_of("i1").unwrap().current_version, "2.0.0");
}

#[tokio::test(start_paused = true)]
async fn test_unrecognised_state_skipped_at_admission() {
    let sim = SimFleet::new(PROJECT);
    sim.add_instance(
        SimInstance::new("i1", "zone-a").unrecognised_state("DELETING"),
    );
    sim.add_instance(
        SimInstance::new("i2", "zone-a")
            .version("2.0.0")
            .upgrade_available("2.1.0"),
    );
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];

    let report = run_fleet(&cfg, &sim).await;
    assert_eq!(
        statuses(&report),
        vec![
            ("i1", OperationStatus::Skipped),
            ("i2", OperationStatus::Succeeded),
        ]
    );
    let i1 = &report.results[0];
    assert_eq!(i1.error_kind, Some(ErrorKind::Ineligible));
    assert!(i1
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("DELETING")));
}

#[tokio::test(start_paused = true)]
async fn test_busy_instance_is_skipped_not_failed() {
    let sim = SimFleet::new(PROJECT);
    sim.add_instance(
        SimInstance::new("i1", "zone-a")
            .state(InstanceState::Upgrading)
            .upgrade_available("2.1.0"),
    );
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];

    let report = run_fleet(&cfg, &sim).await;
    let i1 = &report.results[0];
    assert_eq!(i1.status, OperationStatus::Skipped);
    assert_eq!(i1.error_kind, Some(ErrorKind::Busy));
    assert!(sim.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_begin_precondition_race_is_skipped_busy() {
    let sim = shared_fleet();
    sim.inject_fault(
        METHOD_BEGIN_UPGRADE,
        "i1",
        Error::precondition_violated("another operation is in progress"),
    );
    let report = run_fleet(&upgrade_config(), &sim).await;
    let i1 = report
        .results
        .iter()
        .find(|result| result.instance == "i1")
        .unwrap();
    assert_eq!(i1.status, OperationStatus::Skipped);
    assert_eq!(i1.error_kind, Some(ErrorKind::Busy));
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_fatal_for_the_run() {
    let sim = SimFleet::new(PROJECT);
    for index in 1..=3 {
        sim.add_instance(
            SimInstance::new(&format!("i{index}"), "zone-a")
                .version("2.0.0")
                .upgrade_available("2.1.0"),
        );
    }
    sim.inject_fault(
        METHOD_BEGIN_UPGRADE,
        "i1",
        Error::auth_failed("token expired"),
    );
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.max_parallel = 1;

    let report = run_fleet(&cfg, &sim).await;
    assert_eq!(
        statuses(&report),
        vec![
            ("i1", OperationStatus::Failed),
            ("i2", OperationStatus::Skipped),
            ("i3", OperationStatus::Skipped),
        ]
    );
    assert_eq!(report.results[0].error_kind, Some(ErrorKind::AuthFailed));
    assert_eq!(report.results[1].error_kind, Some(ErrorKind::AuthFailed));
    // Only the first instance was ever attempted.
    assert_eq!(sim.calls_to(METHOD_BEGIN_UPGRADE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_during_discovery_aborts_scanning() {
    let sim = shared_fleet();
    sim.inject_fault(
        METHOD_LIST,
        "zone-a",
        Error::auth_failed("credentials rejected"),
    );
    let report = run_fleet(&upgrade_config(), &sim).await;
    assert!(report.results.is_empty());
    assert!(report
        .message
        .as_deref()
        .is_some_and(|message| message.contains("discovery aborted")));
    // zone-b was never scanned.
    assert_eq!(sim.calls_to(METHOD_LIST).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listing_failure_in_one_location_does_not_stop_others() {
    let sim = shared_fleet();
    sim.inject_fault(
        METHOD_LIST,
        "zone-a",
        Error::transient("backend hiccup"),
    );
    let report = run_fleet(&upgrade_config(), &sim).await;
    // Only zone-b instances were discovered.
    assert!(report
        .results
        .iter()
        .all(|result| result.location == "zone-b"));
    assert_eq!(report.results.len(), 2);
    assert!(report
        .message
        .as_deref()
        .is_some_and(|message| message.contains("zone-a")));
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_fails_the_instance() {
    let sim = SimFleet::new(PROJECT);
    sim.add_instance(
        SimInstance::new("i1", "zone-a")
            .version("2.0.0")
            .upgrade_available("2.1.0")
            .polls_to_complete(1000),
    );
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.operation_timeout_secs = 60;
    cfg.poll_interval_secs = 20;
    cfg.health_check_timeout_secs = 30;

    let report = run_fleet(&cfg, &sim).await;
    let i1 = &report.results[0];
    assert_eq!(i1.status, OperationStatus::Failed);
    assert_eq!(i1.error_kind, Some(ErrorKind::Timeout));
    let duration = i1.duration_seconds.unwrap();
    assert!((40.0..=70.0).contains(&duration), "duration {duration}");
}

#[tokio::test(start_paused = true)]
async fn test_failed_compensation_degrades_to_failed() {
    let sim = SimFleet::new(PROJECT);
    let two_days_ago = Utc::now() - chrono::Duration::days(2);
    sim.add_instance(
        SimInstance::new("i1", "zone-a")
            .version("2.0.0")
            .upgrade_available("2.1.0")
            .previous_version("1.9.0")
            .last_upgrade_at(two_days_ago)
            .fail_upgrade_with(Error::unexpected("image build failed"))
            .fail_rollback_with(Error::unexpected("snapshot missing")),
    );
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.rollback_on_failure = true;

    let report = run_fleet(&cfg, &sim).await;
    let i1 = &report.results[0];
    assert_eq!(i1.status, OperationStatus::Failed);
    assert!(!i1.compensated);
    let message = i1.error_message.as_deref().unwrap();
    assert!(message.contains("image build failed"));
    assert!(message.contains("compensation_error"));
    assert!(message.contains("snapshot missing"));
}

#[tokio::test(start_paused = true)]
async fn test_compensation_skipped_when_ineligible() {
    let sim = SimFleet::new(PROJECT);
    // No upgrade history: a failed upgrade cannot be compensated.
    sim.add_instance(
        SimInstance::new("i1", "zone-a")
            .version("2.0.0")
            .upgrade_available("2.1.0")
            .fail_upgrade_with(Error::unexpected("image build failed")),
    );
    let mut cfg = upgrade_config();
    cfg.locations = vec!["zone-a".to_string()];
    cfg.rollback_on_failure = true;

    let report = run_fleet(&cfg, &sim).await;
    let i1 = &report.results[0];
    assert_eq!(i1.status, OperationStatus::Failed);
    assert!(!i1.compensated);
    assert!(i1
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("not eligible")));
}

#[tokio::test(start_paused = true)]
async fn test_result_ordering_is_deterministic() {
    let stripped = |report: &FleetReport| -> Vec<_> {
        report
            .results
            .iter()
            .map(|result| {
                (
                    result.instance.clone(),
                    result.location.clone(),
                    result.status,
                    result.target_version.clone(),
                    result.error_kind,
                )
            })
            .collect()
    };

    let first = run_fleet(&upgrade_config(), &shared_fleet()).await;
    let second = run_fleet(&upgrade_config(), &shared_fleet()).await;
    assert_eq!(stripped(&first), stripped(&second));

    // Ordered by (location, instance) regardless of completion order.
    let mut expected = first
        .results
        .iter()
        .map(|result| (result.location.clone(), result.instance.clone()))
        .collect::<Vec<_>>();
    expected.sort();
    assert_eq!(
        expected,
        first
            .results
            .iter()
            .map(|result| (result.location.clone(), result.instance.clone()))
            .collect::<Vec<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_locations_scanned_once() {
    let sim = shared_fleet();
    let mut cfg = upgrade_config();
    cfg.locations = vec![
        "zone-a".to_string(),
        "zone-b".to_string(),
        "zone-a".to_string(),
    ];
    cfg.dry_run = true;

    let report = run_fleet(&cfg, &sim).await;
    assert_eq!(report.results.len(), 4);
    assert_eq!(sim.calls_to(METHOD_LIST).len(), 2);
    assert_eq!(report.config.locations, vec!["zone-a", "zone-b"]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected_before_io() {
    let sim = shared_fleet();
    let mut cfg = upgrade_config();
    cfg.max_parallel = 0;

    let error = run(
        &cfg,
        Arc::new(sim.clone()),
        Arc::new(SystemClock),
        &test_logger("invalid_config"),
        clock::never_cancelled(),
    )
    .await
    .expect_err("invalid config must be rejected");
    assert_eq!(error.kind(), ErrorKind::ConfigInvalid);
    assert!(sim.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_live_rollback_starts_stopped_instance_first() {
    let sim = shared_fleet();
    let report = run_fleet(&rollback_config(), &sim).await;

    // i3 was stopped: it is started, then rolled back.
    let i3 = report
        .results
        .iter()
        .find(|result| result.instance == "i3")
        .unwrap();
    assert_eq!(i3.status, OperationStatus::Succeeded);
    let starts = sim.calls_to(fleet_test_utils::sim::METHOD_START);
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].target, "i3");
    assert_eq!(sim.snapshot_of("i3").unwrap().current_version, "1.9.0");

    // i2 has no history and is skipped as ineligible.
    let i2 = report
        .results
        .iter()
        .find(|result| result.instance == "i2")
        .unwrap();
    assert_eq!(i2.status, OperationStatus::Skipped);
    assert_eq!(i2.error_kind, Some(ErrorKind::Ineligible));
}
