//! Aggregator ↔ listener lifecycle: launch, status, completions, shutdown.

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tempfile::TempDir;
  use tokio::time::Instant;

  use crate::{
    Aggregator, AggregatorError, AggregatorState, ListenerError, ListenerState, ShutdownOutcome, TaskLauncher,
    __tests__::helpers::{
      aggregator_settings, fake_addr, fast_listener_settings, hung_listener, scripted_listener, visit_fields, wait_for,
    },
    control::{ListenerEnd, ShutdownPoll, StatusSample},
    domain::record::{CONTENT_TABLE, CrawlId, VisitId},
    storage::{CrawlConfiguration, LocalAggregatorStore, MemoryBackend},
    transport::RecordClient,
  };

  // ==========================================================================
  // End to end
  // ==========================================================================

  #[tokio::test]
  async fn test_records_flow_from_worker_to_completion() {
    let backend = MemoryBackend::new();
    let mut aggregator = Aggregator::new(backend.clone(), aggregator_settings());

    let addr = aggregator
      .launch(TaskLauncher::listener(backend.clone(), fast_listener_settings()))
      .await
      .expect("launch listener");
    assert_eq!(aggregator.listener_address(), Some(addr));
    assert_eq!(aggregator.state(), AggregatorState::Launched);

    let mut client = RecordClient::connect(addr).await.expect("connect");
    for _ in 0..3 {
      client.send_record("http_requests", visit_fields(1, 10)).await.unwrap();
    }
    client.send_record("http_requests", visit_fields(2, 20)).await.unwrap();
    client.send_record("http_requests", visit_fields(1, 11)).await.unwrap();
    client.send_record("javascript", visit_fields(1, 11)).await.unwrap();
    client.send_content(CONTENT_TABLE, b"<html></html>".to_vec()).await.unwrap();
    client.close().await.unwrap();

    assert!(
      wait_for(Duration::from_secs(5), || backend.records().len() == 6 && backend.content_count() == 1).await,
      "listener should persist every record"
    );
    assert!(aggregator.get_status().await.is_ok());

    // visit 10 was finalized before the first visit-11 record was stored
    assert_eq!(aggregator.get_saved_visit_ids(), vec![VisitId(10)]);
    assert!(aggregator.get_saved_visit_ids().is_empty());

    let outcome = aggregator.shutdown().await.expect("shutdown");
    assert!(outcome.is_clean(), "unexpected outcome {:?}", outcome);
    assert_eq!(aggregator.state(), AggregatorState::Stopped);
    assert_eq!(aggregator.listener_address(), None);

    assert_eq!(aggregator.get_saved_visit_ids(), vec![VisitId(11), VisitId(20)]);
    assert!(aggregator.get_saved_visit_ids().is_empty());
  }

  #[tokio::test]
  async fn test_records_sent_before_shutdown_all_persist() {
    const RECORDS: i64 = 20_000;

    let backend = MemoryBackend::new();
    let mut aggregator = Aggregator::new(backend.clone(), aggregator_settings());
    let addr = aggregator
      .launch(TaskLauncher::listener(backend.clone(), fast_listener_settings()))
      .await
      .expect("launch listener");

    let mut client = RecordClient::connect(addr).await.expect("connect");
    for i in 0..RECORDS {
      client.send_record("http_requests", visit_fields(1, i / 100)).await.unwrap();
    }
    client.close().await.unwrap();

    // shut down while most frames are still buffered in the socket
    let outcome = aggregator.shutdown().await.expect("shutdown");
    assert!(outcome.is_clean(), "unexpected outcome {:?}", outcome);
    assert_eq!(backend.records().len(), RECORDS as usize);

    let saved = aggregator.get_saved_visit_ids();
    assert_eq!(saved.len(), (RECORDS / 100) as usize);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_process_launcher_bridges_stdio() {
    let script = r#"printf '%s\n' '{"channel":"status","sample":{"rendezvous":"127.0.0.1:4000"}}'
read line
printf '%s\n' '{"channel":"completion","visit_id":7}'"#;
    let launcher = crate::ProcessLauncher::new("sh").arg("-c").arg(script);

    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    let addr = aggregator.launch(launcher).await.expect("launch child");
    assert_eq!(addr, fake_addr());

    let outcome = aggregator.shutdown().await.expect("shutdown");
    assert!(outcome.is_clean(), "unexpected outcome {:?}", outcome);
    assert_eq!(aggregator.get_saved_visit_ids(), vec![VisitId(7)]);
  }

  /// The child leads its own process group, so a terminal ctrl-c aimed at the
  /// aggregator's group never reaches it.
  #[cfg(target_os = "linux")]
  #[tokio::test]
  async fn test_process_launcher_detaches_process_group() {
    let script = r#"read -r pid _ _ _ pgrp _ < /proc/$$/stat
printf '%s\n' '{"channel":"status","sample":{"rendezvous":"127.0.0.1:4000"}}'
read line
if [ "$pid" = "$pgrp" ]; then v=1; else v=0; fi
printf '{"channel":"completion","visit_id":%s}\n' "$v""#;
    let launcher = crate::ProcessLauncher::new("sh").arg("-c").arg(script);

    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    aggregator.launch(launcher).await.expect("launch child");

    let outcome = aggregator.shutdown().await.expect("shutdown");
    assert!(outcome.is_clean(), "unexpected outcome {:?}", outcome);
    assert_eq!(aggregator.get_saved_visit_ids(), vec![VisitId(1)]);
  }

  // ==========================================================================
  // Launch
  // ==========================================================================

  #[tokio::test]
  async fn test_launch_requires_rendezvous_first() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());

    let err = aggregator
      .launch(scripted_listener(vec![StatusSample::Sample(1)]))
      .await
      .unwrap_err();
    assert!(matches!(err, AggregatorError::Protocol(_)), "got {:?}", err);
    assert_eq!(aggregator.state(), AggregatorState::Unstarted);
    assert_eq!(aggregator.listener_address(), None);
  }

  #[tokio::test]
  async fn test_launch_fails_when_listener_exits_early() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());

    let launcher = TaskLauncher::new(|channels: ListenerEnd| async move {
      drop(channels);
      Ok::<(), ListenerError>(())
    });
    let err = aggregator.launch(launcher).await.unwrap_err();
    assert!(matches!(err, AggregatorError::ListenerExited), "got {:?}", err);
  }

  #[tokio::test]
  async fn test_launch_twice_is_rejected() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());

    assert!(matches!(aggregator.shutdown().await, Err(AggregatorError::NotLaunched)));

    aggregator
      .launch(scripted_listener(vec![StatusSample::Rendezvous(fake_addr())]))
      .await
      .unwrap();
    let again = aggregator
      .launch(scripted_listener(vec![StatusSample::Rendezvous(fake_addr())]))
      .await;
    assert!(matches!(again, Err(AggregatorError::AlreadyLaunched)));

    assert!(aggregator.shutdown().await.unwrap().is_clean());
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  #[tokio::test(start_paused = true)]
  async fn test_get_status_times_out_after_status_timeout() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    aggregator
      .launch(scripted_listener(vec![StatusSample::Rendezvous(fake_addr())]))
      .await
      .unwrap();

    let started = Instant::now();
    let err = aggregator.get_status().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, AggregatorError::ListenerUnresponsive { .. }), "got {:?}", err);
    assert!(elapsed >= Duration::from_secs(120), "failed early after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(121), "failed late after {:?}", elapsed);

    assert!(aggregator.shutdown().await.unwrap().is_clean());
  }

  #[tokio::test(start_paused = true)]
  async fn test_most_recent_status_is_stable_until_stale() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    aggregator
      .launch(scripted_listener(vec![
        StatusSample::Rendezvous(fake_addr()),
        StatusSample::Sample(3),
        StatusSample::Sample(7),
      ]))
      .await
      .unwrap();

    // first call has nothing cached and waits for one sample
    assert_eq!(aggregator.get_most_recent_status().await.unwrap(), 3);
    assert_eq!(aggregator.get_most_recent_status().await.unwrap(), 7);
    assert_eq!(aggregator.get_most_recent_status().await.unwrap(), 7);

    tokio::time::advance(Duration::from_secs(121)).await;
    assert!(matches!(
      aggregator.get_most_recent_status().await,
      Err(AggregatorError::ListenerUnresponsive { .. })
    ));

    assert!(aggregator.shutdown().await.unwrap().is_clean());
  }

  // ==========================================================================
  // Shutdown
  // ==========================================================================

  #[tokio::test(start_paused = true)]
  async fn test_hung_listener_is_killed_after_deadline() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    aggregator.launch(hung_listener()).await.unwrap();

    let outcome = aggregator.shutdown().await.unwrap();
    match outcome {
      ShutdownOutcome::TimedOut { waited, killed } => {
        assert!(killed);
        assert!(waited >= Duration::from_secs(300), "waited only {:?}", waited);
      }
      other => panic!("expected a timeout, got {:?}", other),
    }

    assert_eq!(aggregator.state(), AggregatorState::Stopped);
    assert_eq!(aggregator.listener_address(), None);
    assert!(matches!(aggregator.shutdown().await, Err(AggregatorError::NotLaunched)));
  }

  #[tokio::test]
  async fn test_listener_error_is_a_failed_shutdown() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    let launcher = TaskLauncher::new(|mut channels: ListenerEnd| async move {
      let _ = channels.publish_status(StatusSample::Rendezvous(fake_addr()));
      while channels.poll_shutdown() == ShutdownPoll::Idle {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
      Err(ListenerError::InvalidState {
        expected: ListenerState::Running,
        actual: ListenerState::Init,
      })
    });
    aggregator.launch(launcher).await.unwrap();

    let outcome = aggregator.shutdown().await.unwrap();
    assert!(!outcome.is_clean());
    match outcome {
      ShutdownOutcome::Failed { reason, .. } => assert!(reason.contains("Listener is Init"), "reason {:?}", reason),
      other => panic!("expected a failure, got {:?}", other),
    }
    assert_eq!(aggregator.state(), AggregatorState::Stopped);
    assert_eq!(aggregator.listener_address(), None);
  }

  fn explode() -> Result<(), ListenerError> {
    panic!("listener blew up")
  }

  #[tokio::test]
  async fn test_listener_panic_is_a_failed_shutdown() {
    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    let launcher = TaskLauncher::new(|mut channels: ListenerEnd| async move {
      let _ = channels.publish_status(StatusSample::Rendezvous(fake_addr()));
      while channels.poll_shutdown() == ShutdownPoll::Idle {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
      explode()
    });
    aggregator.launch(launcher).await.unwrap();

    let outcome = aggregator.shutdown().await.unwrap();
    assert!(matches!(outcome, ShutdownOutcome::Failed { .. }), "got {:?}", outcome);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_child_exit_status_is_a_failed_shutdown() {
    let script = r#"printf '%s\n' '{"channel":"status","sample":{"rendezvous":"127.0.0.1:4000"}}'
read line
exit 3"#;
    let launcher = crate::ProcessLauncher::new("sh").arg("-c").arg(script);

    let mut aggregator = Aggregator::new(MemoryBackend::new(), aggregator_settings());
    aggregator.launch(launcher).await.expect("launch child");

    let outcome = aggregator.shutdown().await.expect("shutdown");
    match outcome {
      ShutdownOutcome::Failed { reason, .. } => assert!(reason.contains('3'), "reason {:?}", reason),
      other => panic!("expected a failure, got {:?}", other),
    }
  }

  // ==========================================================================
  // Delegated storage calls
  // ==========================================================================

  #[tokio::test]
  async fn test_ids_and_configuration_go_to_backend() {
    let dir = TempDir::new().unwrap();
    let store = LocalAggregatorStore::open(dir.path()).await.unwrap();
    let aggregator = Aggregator::new(store, aggregator_settings());

    assert_eq!(aggregator.get_next_crawl_id().await.unwrap(), CrawlId(1));
    assert_eq!(aggregator.get_next_visit_id().await.unwrap(), VisitId(1));
    assert_eq!(aggregator.get_next_visit_id().await.unwrap(), VisitId(2));

    aggregator
      .save_configuration(&CrawlConfiguration {
        crawler_version: "0.1.0".into(),
        browser_version: "firefox".into(),
        parameters: json!({"headless": true}),
      })
      .await
      .unwrap();
    assert!(dir.path().join("configuration.json").exists());
  }
}
