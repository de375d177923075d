//! Visit grouping driven through the listener directly.

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use pretty_assertions::assert_eq;
  use serde_json::json;
  use tempfile::TempDir;

  use crate::{
    Listener,
    __tests__::helpers::{fast_listener_settings, visit_fields, visit_record},
    control::{self, ManagerEnd},
    domain::record::{CrawlId, Record, VisitId},
    storage::{LocalBackend, MemoryBackend, MemoryEvent},
  };

  fn listener() -> (ManagerEnd, MemoryBackend, Listener<MemoryBackend>) {
    let (manager, channels) = control::pair();
    let backend = MemoryBackend::new();
    let listener = Listener::new(channels, backend.clone(), fast_listener_settings());
    (manager, backend, listener)
  }

  fn position(events: &[MemoryEvent], matches: impl Fn(&MemoryEvent) -> bool) -> Vec<usize> {
    events
      .iter()
      .enumerate()
      .filter(|(_, e)| matches(e))
      .map(|(i, _)| i)
      .collect()
  }

  // ==========================================================================
  // Reference scenario
  // ==========================================================================

  /// crawl 1: visit 10 x3 then visit 11 x2; crawl 2: visit 20 x1.
  #[tokio::test]
  async fn test_two_crawls_three_visits() {
    let (mut manager, backend, mut listener) = listener();

    for _ in 0..3 {
      listener.process_record(visit_record(1, 10)).await.unwrap();
    }
    assert!(manager.drain_completions().is_empty());

    listener.process_record(visit_record(2, 20)).await.unwrap();
    listener.process_record(visit_record(1, 11)).await.unwrap();
    assert_eq!(manager.drain_completions(), vec![VisitId(10)]);

    listener.process_record(visit_record(1, 11)).await.unwrap();
    assert!(manager.drain_completions().is_empty());

    let events = backend.events();
    let visit_10 = position(&events, |e| {
      matches!(e, MemoryEvent::Record { visit_id: Some(VisitId(10)), .. })
    });
    let visit_11 = position(&events, |e| {
      matches!(e, MemoryEvent::Record { visit_id: Some(VisitId(11)), .. })
    });
    let done_10 = position(&events, |e| {
      matches!(e, MemoryEvent::VisitDone { visit_id: VisitId(10), .. })
    });
    assert_eq!(visit_10.len(), 3);
    assert_eq!(visit_11.len(), 2);
    assert_eq!(done_10.len(), 1);
    assert!(visit_10[2] < done_10[0]);
    assert!(done_10[0] < visit_11[0]);

    listener.shutdown().await.unwrap();
    assert_eq!(manager.drain_completions(), vec![VisitId(11), VisitId(20)]);
    assert_eq!(
      backend.finished_visits(),
      vec![(VisitId(10), false), (VisitId(11), true), (VisitId(20), true)]
    );
    assert_eq!(backend.records_for(VisitId(11)).len(), 2);
  }

  // ==========================================================================
  // Interleavings
  // ==========================================================================

  /// Each crawl walks through its own visits; crawls are interleaved in a
  /// scrambled but reproducible order.
  #[tokio::test]
  async fn test_interleaved_crawls_finalize_each_visit_once() {
    let (mut manager, backend, mut listener) = listener();

    // crawl → remaining records, in order
    let mut queues: Vec<(i64, Vec<i64>)> = (1..=4)
      .map(|crawl| {
        let visits = (0..5).flat_map(|k| std::iter::repeat_n(crawl * 100 + k, (k as usize % 3) + 1));
        (crawl, visits.collect())
      })
      .collect();
    let total: usize = queues.iter().map(|(_, v)| v.len()).sum();

    let mut current: HashMap<i64, i64> = HashMap::new();
    let mut completed: Vec<VisitId> = Vec::new();
    let mut seed: u64 = 0x2545_f491;

    for _ in 0..total {
      seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
      let live: Vec<usize> = (0..queues.len()).filter(|&i| !queues[i].1.is_empty()).collect();
      let pick = live[(seed >> 33) as usize % live.len()];
      let (crawl, visits) = &mut queues[pick];
      let visit = visits.remove(0);

      listener.process_record(visit_record(*crawl, visit)).await.unwrap();
      let emitted = manager.drain_completions();

      match current.insert(*crawl, visit) {
        Some(previous) if previous != visit => assert_eq!(emitted, vec![VisitId(previous)]),
        _ => assert!(emitted.is_empty(), "unexpected completion {:?}", emitted),
      }
      completed.extend(emitted);
    }

    listener.shutdown().await.unwrap();
    completed.extend(manager.drain_completions());

    completed.sort();
    let mut expected: Vec<VisitId> = (1..=4)
      .flat_map(|crawl| (0..5).map(move |k| VisitId(crawl * 100 + k)))
      .collect();
    expected.sort();
    assert_eq!(completed, expected);
    assert_eq!(backend.records().len(), total);
  }

  // ==========================================================================
  // Malformed records
  // ==========================================================================

  #[tokio::test]
  async fn test_unattributable_records_never_persist() {
    let (mut manager, backend, mut listener) = listener();

    let malformed = [
      json!({"crawl_id": 1}),
      json!({"visit_id": 10}),
      json!({"crawl_id": "1", "visit_id": 10}),
      json!({"crawl_id": 1, "visit_id": null}),
      json!({}),
    ];
    for fields in malformed {
      let record = Record::new("javascript", fields.as_object().cloned().unwrap());
      listener.process_record(record).await.unwrap();
    }

    assert!(backend.records().is_empty());
    assert!(backend.events().is_empty());
    assert!(listener.open_visits().is_empty());

    listener.shutdown().await.unwrap();
    assert!(manager.drain_completions().is_empty());
    assert_eq!(backend.events(), vec![MemoryEvent::Closed]);
  }

  #[tokio::test]
  async fn test_malformed_record_does_not_disturb_open_visit() {
    let (mut manager, _backend, mut listener) = listener();

    listener.process_record(visit_record(3, 30)).await.unwrap();
    let orphan = Record::new("javascript", json!({"visit_id": 31}).as_object().cloned().unwrap());
    listener.process_record(orphan).await.unwrap();
    listener.process_record(visit_record(3, 30)).await.unwrap();

    assert!(manager.drain_completions().is_empty());
    assert_eq!(listener.open_visits().get(&CrawlId(3)), Some(&VisitId(30)));
  }

  /// A record with an unusable table name is dropped on its own. The visit it
  /// belongs to still completes and its other records are written.
  #[tokio::test]
  async fn test_bad_table_does_not_lose_its_visit() {
    let dir = TempDir::new().unwrap();
    let backend = LocalBackend::open(dir.path()).await.unwrap();
    let (mut manager, channels) = control::pair();
    let mut listener = Listener::new(channels, backend, fast_listener_settings());

    listener.process_record(visit_record(1, 10)).await.unwrap();
    listener
      .process_record(Record::new("bad table", visit_fields(1, 10)))
      .await
      .unwrap();
    listener.process_record(visit_record(1, 10)).await.unwrap();
    listener.process_record(visit_record(1, 11)).await.unwrap();
    assert_eq!(manager.drain_completions(), vec![VisitId(10)]);

    let written = std::fs::read_to_string(dir.path().join("http_requests.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 2);
    assert!(!dir.path().join("bad table.jsonl").exists());

    listener.shutdown().await.unwrap();
    assert_eq!(manager.drain_completions(), vec![VisitId(11)]);
    let written = std::fs::read_to_string(dir.path().join("http_requests.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 3);
  }
}
