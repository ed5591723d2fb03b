//! Integration tests replaying the demo scenario under each reentrance
//! policy.

use reflux_core::{Phase, Reentrance, Store};
use reflux_testkit::prelude::*;

fn errors(report: &ScenarioReport) -> Vec<bool> {
    report.calls.iter().map(|call| !call.succeeded()).collect()
}

#[tokio::test(start_paused = true)]
async fn prevent_with_error_rejects_overlapping_calls() {
    let report = run_reentrance_scenario(Reentrance::PreventWithError).await.unwrap();

    assert_eq!(errors(&report), vec![false, true, true]);
    for call in &report.calls[1..] {
        let error = call.error.as_deref().unwrap();
        assert!(error.contains("DemoModel.load is not reentrant over"), "{error}");
    }
    assert_eq!(
        report.output,
        vec![
            "Url: reactronic",
            "Log: RTA",
            "[...] Url: reactronic",
            "[...] Log: RTA",
            "[...] Url: google.com",
            "[...] Log: RTA, google.com/300",
            "Url: google.com",
            "Log: RTA, google.com/300",
        ]
    );
    assert_eq!(report.url, "google.com");
}

#[tokio::test(start_paused = true)]
async fn cancel_previous_keeps_only_last_call() {
    let report = run_reentrance_scenario(Reentrance::CancelPrevious).await.unwrap();

    assert_eq!(errors(&report), vec![true, true, false]);
    for call in &report.calls[..2] {
        let error = call.error.as_deref().unwrap();
        assert!(error.contains("is canceled"), "{error}");
    }
    assert_eq!(
        report.output,
        vec![
            "Url: reactronic",
            "Log: RTA",
            "[...] Url: reactronic",
            "[...] Log: RTA",
            "[...] Url: nezaboodka.com",
            "[...] Log: RTA, nezaboodka.com/500",
            "Url: nezaboodka.com",
            "Log: RTA, nezaboodka.com/500",
        ]
    );
    assert_eq!(report.log, vec!["RTA", "nezaboodka.com/500"]);
}

#[tokio::test(start_paused = true)]
async fn wait_and_restart_runs_calls_in_order() {
    let report = run_reentrance_scenario(Reentrance::WaitAndRestart).await.unwrap();

    assert_eq!(errors(&report), vec![false, false, false]);
    assert_eq!(
        report.output,
        vec![
            "Url: reactronic",
            "Log: RTA",
            "[...] Url: reactronic",
            "[...] Log: RTA",
            "[...] Url: google.com",
            "[...] Log: RTA, google.com/300",
            "[...] Url: microsoft.com",
            "[...] Log: RTA, google.com/300, microsoft.com/200",
            "[...] Url: nezaboodka.com",
            "[...] Log: RTA, google.com/300, microsoft.com/200, nezaboodka.com/500",
            "Url: nezaboodka.com",
            "Log: RTA, google.com/300, microsoft.com/200, nezaboodka.com/500",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn side_by_side_commits_first_finisher() {
    let report = run_reentrance_scenario(Reentrance::RunSideBySide).await.unwrap();

    assert_eq!(errors(&report), vec![true, false, true]);
    for call in [&report.calls[0], &report.calls[2]] {
        let error = call.error.as_deref().unwrap();
        assert!(error.contains("conflicts with other transactions"), "{error}");
    }
    assert_eq!(
        report.output,
        vec![
            "Url: reactronic",
            "Log: RTA",
            "[...] Url: reactronic",
            "[...] Log: RTA",
            "[...] Url: microsoft.com",
            "[...] Log: RTA, microsoft.com/200",
            "Url: microsoft.com",
            "Log: RTA, microsoft.com/200",
        ]
    );
    assert_eq!(report.log, vec!["RTA", "microsoft.com/200"]);
}

#[tokio::test(start_paused = true)]
async fn first_call_is_unaffected_by_rejected_ones() {
    let store = Store::new();
    let model = DemoModel::new(&store, Reentrance::PreventWithError).unwrap();

    let first = tokio::spawn(model.load("google.com", 300).unwrap());
    tokio::task::yield_now().await;
    assert_eq!(model.loader().cache().phase(), Phase::Running);
    assert!(model.load("microsoft.com", 200).is_err());

    assert!(model.monitor().is_busy());
    assert_eq!(model.monitor().worker_count(), 1);

    first.await.unwrap().unwrap();
    assert!(!model.monitor().is_busy());
    assert_eq!(model.log().unwrap(), vec!["RTA", "google.com/300"]);
    assert_eq!(model.loader().cache().observe(), Phase::Finished);
    assert_eq!(model.loader().cache().phase(), Phase::Idle);
}

#[test]
fn report_serializes_to_json() {
    let report = ScenarioReport {
        policy: "CancelPrevious".to_string(),
        output: vec!["Url: reactronic".to_string()],
        calls: vec![CallOutcome {
            url: "google.com".to_string(),
            delay_ms: 300,
            error: None,
        }],
        url: "reactronic".to_string(),
        log: vec!["RTA".to_string()],
    };
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["calls"][0]["delay_ms"], 300);
    assert!(json["calls"][0].get("error").is_none());
}
