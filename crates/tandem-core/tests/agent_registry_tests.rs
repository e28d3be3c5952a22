//! Agent session registry integration tests
//!
//! Drives the registry through the scripted fake protocol:
//! - send transitions (cold spawn, push onto a live stream, rejections)
//! - dispatch of stream events into state, transcript and notifications
//! - cancel, close and shutdown teardown
//! - reopen from storage and credential profile drift

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tandem_core::config::{Config, CredentialProfile};
use tandem_core::env::StaticProfiles;
use tandem_core::error::{Error, ErrorKind};
use tandem_core::notify::Notification;
use tandem_core::session::{
    AgentRegistry, AgentStatus, CreateAgentOptions, MemoryStore, SendOptions, SendOutcome,
    SessionListener, SessionStore, TranscriptRole,
};
use tandem_core::stream::ResultEvent;
use tandem_core::testing::{
    FailingStore, FakeProtocol, FakeTreeKiller, RecordingNotifier, wait_until,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    registry: Arc<AgentRegistry>,
    protocol: FakeProtocol,
    notifier: RecordingNotifier,
    killer: FakeTreeKiller,
    dir: TempDir,
}

impl Harness {
    fn new(protocol: FakeProtocol) -> Self {
        Self::with_store(protocol, Arc::new(MemoryStore::new()))
    }

    fn with_store(protocol: FakeProtocol, store: Arc<dyn SessionStore>) -> Self {
        Self::build(protocol, store, None)
    }

    fn build(
        protocol: FakeProtocol,
        store: Arc<dyn SessionStore>,
        profile: Option<CredentialProfile>,
    ) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = Config::default();
        config.agent.sessions_root = Some(dir.path().to_path_buf());
        config.agent.close_timeout_ms = 500;

        let notifier = RecordingNotifier::new();
        let killer = FakeTreeKiller::new();
        let registry = AgentRegistry::new(
            &config,
            Arc::new(protocol.clone()),
            store,
            Arc::new(notifier.clone()),
        )
        .with_profiles(Arc::new(StaticProfiles::new(profile)))
        .with_tree_killer(Arc::new(killer.clone()));

        Self {
            registry: Arc::new(registry),
            protocol,
            notifier,
            killer,
            dir,
        }
    }

    fn create(&self) -> String {
        self.create_with(CreateAgentOptions::default())
    }

    fn create_with(&self, mut options: CreateAgentOptions) -> String {
        if options.cwd.is_none() {
            options.cwd = Some(self.dir.path().to_path_buf());
        }
        self.registry.create(options).id
    }

    fn status(&self, id: &str) -> AgentStatus {
        self.registry.get(id).expect("session should be resident").status
    }

    async fn wait_status(&self, id: &str, status: AgentStatus) -> bool {
        wait_until(WAIT, || {
            self.registry.get(id).map(|v| v.status) == Some(status)
        })
        .await
    }

    /// Statuses notified for `id`, in order
    fn statuses(&self, id: &str) -> Vec<(AgentStatus, bool)> {
        self.notifier
            .on_channel("agent:status")
            .into_iter()
            .filter(|n| n.session_id() == id)
            .filter_map(|n| match n {
                Notification::AgentStatus {
                    status,
                    process_exited,
                    ..
                } => Some((status, process_exited)),
                _ => None,
            })
            .collect()
    }

    /// Both invariants: live stream all-or-nothing (by construction) and
    /// never streaming without one
    fn assert_invariants(&self) {
        for view in self.registry.list() {
            if view.status == AgentStatus::Streaming {
                assert!(view.has_live_stream, "streaming without a stream: {:?}", view);
            }
        }
    }
}

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_message_spawns_and_returns_to_idle() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let id = h.create();
        assert_eq!(h.status(&id), AgentStatus::Idle);

        let outcome = h
            .registry
            .send_message(&id, "hello", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Spawned);
        h.assert_invariants();

        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);
        assert_eq!(h.status(&id), AgentStatus::Idle);
        assert_eq!(h.protocol.spawn_count(), 1);

        let query = h.protocol.last().unwrap();
        assert_eq!(query.received_texts(), vec!["hello".to_string()]);

        let statuses: Vec<AgentStatus> = h.statuses(&id).into_iter().map(|(s, _)| s).collect();
        assert_eq!(statuses, vec![AgentStatus::Streaming, AgentStatus::Idle]);

        // The stream stays open for the next turn
        assert!(h.registry.get(&id).unwrap().has_live_stream);
        h.assert_invariants();
    }

    #[tokio::test]
    async fn test_send_while_streaming_is_rejected() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();

        h.registry
            .send_message(&id, "first", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(h.status(&id), AgentStatus::Streaming);
        let query = h.protocol.last().unwrap();
        assert!(wait_until(WAIT, || query.received().len() == 1).await);

        let err = h
            .registry
            .send_message(&id, "second", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyStreaming(_)));
        assert_eq!(err.kind(), ErrorKind::StateConflict);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.protocol.spawn_count(), 1);
        assert_eq!(query.received_texts(), vec!["first".to_string()]);
        assert!(h.registry.get(&id).unwrap().has_live_stream);

        // The untouched bridge still carries the next turn
        query.emit_result(0.01);
        assert!(h.wait_status(&id, AgentStatus::Idle).await);
        let outcome = h
            .registry
            .send_message(&id, "third", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Pushed);
        assert!(wait_until(WAIT, || query.received().len() == 2).await);
        assert_eq!(query.received_texts(), vec!["first".to_string(), "third".to_string()]);
    }

    #[tokio::test]
    async fn test_pushes_arrive_in_order() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let id = h.create();

        for (turn, text) in ["one", "two", "three"].iter().enumerate() {
            h.registry
                .send_message(&id, *text, SendOptions::default())
                .await
                .unwrap();
            assert!(
                wait_until(WAIT, || h.registry.get(&id).unwrap().turns == turn as u64 + 1).await
            );
        }

        let query = h.protocol.last().unwrap();
        assert_eq!(h.protocol.spawn_count(), 1);
        assert_eq!(query.received_texts(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = Harness::new(FakeProtocol::new());
        let err = h
            .registry
            .send_message("missing", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSession(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_before_spawning() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        let err = h
            .registry
            .send_message(&id, "  ", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
        assert_eq!(h.protocol.spawn_count(), 0);
        assert_eq!(h.status(&id), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_error_status() {
        let h = Harness::new(FakeProtocol::new());
        h.protocol.fail_next("cli not found");
        let id = h.create();

        let outcome = h
            .registry
            .send_message(&id, "hello", SendOptions::default())
            .await
            .unwrap();
        match outcome {
            SendOutcome::Failed { message } => assert!(message.contains("cli not found")),
            other => panic!("unexpected outcome {:?}", other),
        }

        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, AgentStatus::Error);
        assert!(!view.has_live_stream);
        assert_eq!(h.notifier.count("agent:error"), 1);
        h.assert_invariants();

        // The next send retries the cold path
        let outcome = h
            .registry
            .send_message(&id, "again", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Spawned);
        assert_eq!(h.status(&id), AgentStatus::Streaming);
    }

    #[tokio::test]
    async fn test_send_options_reach_the_query() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create_with(CreateAgentOptions {
            model: Some("session-model".to_string()),
            ..Default::default()
        });

        let options = SendOptions {
            model: Some("override".to_string()),
            max_turns: Some(3),
        };
        h.registry.send_message(&id, "hi", options).await.unwrap();

        let query = h.protocol.last().unwrap();
        assert_eq!(query.model().as_deref(), Some("override"));
        assert_eq!(query.max_turns(), Some(3));
        assert_eq!(query.resume(), None);
        assert_eq!(h.registry.get(&id).unwrap().pid, Some(query.pid()));
    }

    #[tokio::test]
    async fn test_user_turn_is_echoed_and_recorded() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let id = h.create();
        h.registry
            .send_message(&id, "hello", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);

        assert_eq!(h.notifier.count("agent:user-message"), 1);
        let transcript = h.registry.transcript(&id).unwrap();
        assert_eq!(transcript[0].role, TranscriptRole::User);
        assert_eq!(transcript[0].content, "hello");
        assert_eq!(transcript[1].role, TranscriptRole::Assistant);
        assert_eq!(transcript[1].content, "echo: hello");
    }
}

mod dispatch_tests {
    use super::*;

    #[derive(Default)]
    struct CountingListener {
        results: AtomicUsize,
        errors: AtomicUsize,
    }

    impl SessionListener for CountingListener {
        fn on_result(&self, _session_id: &str, _result: &ResultEvent) {
            self.results.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _session_id: &str, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;

    impl SessionListener for PanickingListener {
        fn on_result(&self, _session_id: &str, _result: &ResultEvent) {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn test_init_captures_resume_id() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let id = h.create();
        h.registry
            .send_message(&id, "hello", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);

        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.resume_id.as_deref(), Some("conv-0"));
        assert_eq!(view.model.as_deref(), Some("fake-model"));
        assert_eq!(h.notifier.count("agent:init"), 1);
    }

    #[tokio::test]
    async fn test_cost_and_usage_accumulate() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let id = h.create();

        h.registry
            .send_message(&id, "a", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);
        h.registry
            .send_message(&id, "b", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 2).await);

        let view = h.registry.get(&id).unwrap();
        // The CLI reports running totals of 0.01 then 0.02
        assert!((view.total_cost_usd - 0.02).abs() < 1e-9);
        assert_eq!(view.input_tokens, 20);
        assert_eq!(view.output_tokens, 10);
        assert_eq!(h.notifier.count("agent:result"), 2);
        assert_eq!(h.notifier.count("agent:usage"), 2);
    }

    #[tokio::test]
    async fn test_unknown_events_pass_through() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();
        let query = h.protocol.last().unwrap();

        query.emit_json(serde_json::json!({"type": "brand_new", "payload": 1}));
        query.emit_json(serde_json::json!({"type": "stream_event", "event": {"delta": "x"}}));
        query.emit_json(serde_json::json!({
            "type": "tool_progress",
            "tool_use_id": "t1",
            "tool_name": "Bash",
            "elapsed_time_seconds": 2.5,
        }));

        assert!(wait_until(WAIT, || h.notifier.count("agent:tool-progress") == 1).await);
        let raw = h.notifier.on_channel("agent:raw");
        assert_eq!(raw.len(), 1);
        match &raw[0] {
            Notification::AgentRaw { payload, .. } => assert_eq!(payload["type"], "brand_new"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.notifier.count("agent:delta"), 1);
        // Deltas never reach the transcript
        assert_eq!(h.registry.transcript(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_sets_error_and_informs_listener() {
        let h = Harness::new(FakeProtocol::new());
        let listener = Arc::new(CountingListener::default());
        h.registry.set_listener(Some(listener.clone()));
        let id = h.create();

        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();
        h.protocol.last().unwrap().fail("crashed");

        assert!(h.wait_status(&id, AgentStatus::Error).await);
        let view = h.registry.get(&id).unwrap();
        assert!(!view.has_live_stream);
        assert_eq!(view.pid, None);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
        assert_eq!(h.notifier.count("agent:error"), 1);
        assert_eq!(
            h.statuses(&id).last(),
            Some(&(AgentStatus::Error, true))
        );
    }

    #[tokio::test]
    async fn test_process_exit_returns_to_idle_and_next_send_is_cold() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();
        let first = h.protocol.last().unwrap();
        first.emit_init("conv-x");
        first.emit_result(0.01);
        first.finish();

        assert!(wait_until(WAIT, || !h.registry.get(&id).unwrap().has_live_stream).await);
        assert_eq!(h.status(&id), AgentStatus::Idle);
        assert_eq!(h.statuses(&id).last(), Some(&(AgentStatus::Idle, true)));

        let outcome = h
            .registry
            .send_message(&id, "again", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Spawned);
        assert_eq!(h.protocol.last().unwrap().resume().as_deref(), Some("conv-x"));
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_break_the_loop() {
        let h = Harness::new(FakeProtocol::auto_reply());
        h.registry.set_listener(Some(Arc::new(PanickingListener)));
        let id = h.create();

        h.registry
            .send_message(&id, "a", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);
        h.registry
            .send_message(&id, "b", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 2).await);
        assert_eq!(h.status(&id), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_listener_hears_results() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let listener = Arc::new(CountingListener::default());
        h.registry.set_listener(Some(listener.clone()));
        let id = h.create();

        h.registry
            .send_message(&id, "a", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || listener.results.load(Ordering::SeqCst) == 1).await);
    }
}

mod cancel_tests {
    use super::*;

    #[tokio::test]
    async fn test_cooperative_cancel_keeps_the_stream() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "one", SendOptions::default())
            .await
            .unwrap();
        let query = h.protocol.last().unwrap();

        h.registry.cancel(&id).await.unwrap();
        assert_eq!(query.interrupts(), 1);
        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, AgentStatus::Idle);
        assert!(view.has_live_stream);
        assert!(!query.is_closed());

        let outcome = h
            .registry
            .send_message(&id, "two", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Pushed);
        assert_eq!(h.protocol.spawn_count(), 1);
        assert!(wait_until(WAIT, || query.received().len() == 2).await);
        assert_eq!(query.received_texts(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_failed_interrupt_falls_back_to_teardown() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "one", SendOptions::default())
            .await
            .unwrap();
        let query = h.protocol.last().unwrap();
        query.set_interrupt_fails(true);

        h.registry.cancel(&id).await.unwrap();

        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, AgentStatus::Idle);
        assert!(!view.has_live_stream);
        assert!(query.is_closed());
        assert_eq!(h.killer.killed(), vec![query.pid()]);
        h.assert_invariants();

        let outcome = h
            .registry
            .send_message(&id, "two", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Spawned);
        assert_eq!(h.protocol.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_without_stream_is_idle() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry.cancel(&id).await.unwrap();
        assert_eq!(h.status(&id), AgentStatus::Idle);
    }
}

mod close_tests {
    use super::*;

    #[tokio::test]
    async fn test_close_mid_stream_removes_once() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();
        let query = h.protocol.last().unwrap();
        assert!(wait_until(WAIT, || query.received().len() == 1).await);
        query.emit_assistant("partial answer");

        h.registry.close(&id).await.unwrap();
        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.registry.len(), 0);
        assert_eq!(h.notifier.count("agent:closed"), 1);
        assert_eq!(h.killer.killed(), vec![query.pid()]);
        assert!(query.is_closed());

        h.registry.close(&id).await.unwrap();
        assert_eq!(h.notifier.count("agent:closed"), 1);
        assert_eq!(h.killer.killed().len(), 1);
    }

    #[tokio::test]
    async fn test_close_marks_record_closed() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::with_store(FakeProtocol::auto_reply(), store.clone());
        let id = h.create();
        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);

        h.registry.close(&id).await.unwrap();
        let record = store.get_session(&id).unwrap().unwrap();
        assert_eq!(record.status, tandem_core::session::RecordStatus::Closed);
        assert_eq!(record.resume_id.as_deref(), Some("conv-0"));
        assert_eq!(record.turns, 1);
    }

    #[tokio::test]
    async fn test_close_ignores_exit_error_of_killed_process() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();
        let query = h.protocol.last().unwrap();
        query.set_close_reports_exit(true);
        assert!(query.emit_init("conv-1"));
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().resume_id.is_some()).await);

        h.registry.close(&id).await.unwrap();

        assert!(h.registry.get(&id).is_none());
        assert_eq!(h.notifier.count("agent:error"), 0);
        assert!(
            h.statuses(&id)
                .iter()
                .all(|(status, _)| *status != AgentStatus::Error)
        );
        assert_eq!(h.notifier.count("agent:closed"), 1);
    }

    #[tokio::test]
    async fn test_close_all_sync_kills_each_process_once() {
        let h = Harness::with_store(FakeProtocol::new(), Arc::new(FailingStore));
        let mut ids = Vec::new();
        for n in 0..3 {
            let id = h.create();
            h.registry
                .send_message(&id, format!("hello {}", n), SendOptions::default())
                .await
                .unwrap();
            ids.push(id);
        }
        // One session without a process
        h.create();
        assert_eq!(h.registry.len(), 4);

        h.registry.close_all_sync();

        assert_eq!(h.registry.len(), 0);
        let mut killed = h.killer.killed();
        killed.sort_unstable();
        let mut expected: Vec<u32> = h.protocol.queries().iter().map(|q| q.pid()).collect();
        expected.sort_unstable();
        assert_eq!(killed, expected);
        assert!(h.protocol.queries().iter().all(|q| q.is_closed()));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let store = Arc::new(MemoryStore::new());
        let h = Harness::with_store(FakeProtocol::new(), store.clone());
        let id = h.create();
        assert!(store.get_session(&id).unwrap().is_some());

        h.registry.delete(&id).await.unwrap();
        assert!(store.get_session(&id).unwrap().is_none());
        assert!(h.registry.get(&id).is_none());
    }
}

mod reopen_tests {
    use super::*;

    fn profile(id: &str, base_url: Option<&str>) -> CredentialProfile {
        CredentialProfile {
            id: id.to_string(),
            name: id.to_string(),
            base_url: base_url.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reopen_reports_profile_drift() {
        let store = Arc::new(MemoryStore::new());
        let first = Harness::build(
            FakeProtocol::new(),
            store.clone(),
            Some(profile("work", Some("https://a.example.com"))),
        );
        let id = first.create();

        let same = Harness::build(
            FakeProtocol::new(),
            store.clone(),
            Some(profile("work", Some("https://a.example.com"))),
        );
        let reopened = same.registry.reopen(&id).unwrap();
        assert!(!reopened.profile_changed);
        assert_eq!(reopened.session.status, AgentStatus::Idle);

        let moved = Harness::build(
            FakeProtocol::new(),
            store,
            Some(profile("work", Some("https://b.example.com"))),
        );
        let reopened = moved.registry.reopen(&id).unwrap();
        assert!(reopened.profile_changed);
        // Drift never blocks
        assert!(moved.registry.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_drift_without_base_url_compares_ids() {
        let store = Arc::new(MemoryStore::new());
        let first = Harness::build(FakeProtocol::new(), store.clone(), Some(profile("a", None)));
        let id = first.create();

        let other = Harness::build(FakeProtocol::new(), store, Some(profile("b", None)));
        assert!(other.registry.reopen(&id).unwrap().profile_changed);
    }

    #[tokio::test]
    async fn test_send_reopens_and_resumes() {
        let store = Arc::new(MemoryStore::new());
        let first = Harness::with_store(FakeProtocol::auto_reply(), store.clone());
        let id = first.create();
        first
            .registry
            .send_message(&id, "hello", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || first.registry.get(&id).unwrap().turns == 1).await);
        first.registry.close(&id).await.unwrap();

        let second = Harness::with_store(FakeProtocol::new(), store);
        let outcome = second
            .registry
            .send_message(&id, "still there?", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Spawned);
        assert_eq!(second.protocol.last().unwrap().resume().as_deref(), Some("conv-0"));

        let view = second.registry.get(&id).unwrap();
        assert_eq!(view.turns, 1);
        // user + assistant from the first run, then the new user turn
        assert_eq!(view.transcript_len, 3);
    }

    #[tokio::test]
    async fn test_reopen_unknown() {
        let h = Harness::new(FakeProtocol::new());
        assert!(matches!(h.registry.reopen("nope"), Err(Error::UnknownSession(_))));
    }
}

mod compact_tests {
    use super::*;

    #[tokio::test]
    async fn test_compact_without_stream_or_resume_id() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        let err = h.registry.compact_conversation(&id).await.unwrap_err();
        assert!(matches!(err, Error::NoActiveStream(_)));
    }

    #[tokio::test]
    async fn test_compact_pushes_onto_live_stream() {
        let h = Harness::new(FakeProtocol::auto_reply());
        let id = h.create();
        h.registry
            .send_message(&id, "hello", SendOptions::default())
            .await
            .unwrap();
        assert!(wait_until(WAIT, || h.registry.get(&id).unwrap().turns == 1).await);

        let outcome = h.registry.compact_conversation(&id).await.unwrap();
        assert_eq!(outcome, SendOutcome::Pushed);
        let query = h.protocol.last().unwrap();
        assert!(wait_until(WAIT, || query.received().len() == 2).await);
        assert_eq!(query.received_texts()[1], "/compact");
    }

    #[tokio::test]
    async fn test_compact_spins_up_one_turn_process() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create_with(CreateAgentOptions {
            resume_id: Some("conv-old".to_string()),
            ..Default::default()
        });

        let outcome = h.registry.compact_conversation(&id).await.unwrap();
        assert_eq!(outcome, SendOutcome::Spawned);
        let query = h.protocol.last().unwrap();
        assert_eq!(query.max_turns(), Some(1));
        assert_eq!(query.resume().as_deref(), Some("conv-old"));
        assert!(wait_until(WAIT, || query.received().len() == 1).await);
        assert_eq!(query.received_texts(), vec!["/compact"]);
    }
}

mod introspection_tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_live_stream() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        assert!(matches!(
            h.registry.supported_models(&id).await,
            Err(Error::NoActiveStream(_))
        ));
        assert!(matches!(
            h.registry.initialization_result(&id).await,
            Err(Error::NoActiveStream(_))
        ));
        assert!(matches!(
            h.registry.set_model(&id, Some("x".to_string())).await,
            Err(Error::NoActiveStream(_))
        ));
    }

    #[tokio::test]
    async fn test_delegates_to_live_stream() {
        let h = Harness::new(FakeProtocol::new());
        let id = h.create();
        h.registry
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap();

        let models = h.registry.supported_models(&id).await.unwrap();
        assert_eq!(models[0].value, "fake-model");
        let commands = h.registry.supported_commands(&id).await.unwrap();
        assert_eq!(commands[0].name, "compact");
        let account = h.registry.account_info(&id).await.unwrap();
        assert_eq!(account["email"], "test@example.com");
        assert!(h.registry.mcp_server_status(&id).await.unwrap().is_empty());

        let first = h.registry.initialization_result(&id).await.unwrap();
        let second = h.registry.initialization_result(&id).await.unwrap();
        assert_eq!(first, second);

        h.registry
            .set_model(&id, Some("other".to_string()))
            .await
            .unwrap();
        assert_eq!(h.registry.get(&id).unwrap().model.as_deref(), Some("other"));
        assert_eq!(
            h.protocol.last().unwrap().model_changes(),
            vec![Some("other".to_string())]
        );
    }
}
