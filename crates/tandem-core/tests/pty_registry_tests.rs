//! PTY session registry integration tests
//!
//! Uses the fake pseudo-terminal backend with paused time so the graceful
//! close escalation can be observed step by step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tandem_core::config::Config;
use tandem_core::error::Error;
use tandem_core::notify::Notification;
use tandem_core::pty::{CreatePtyOptions, PtyRegistry, PtyStatus, Visibility};
use tandem_core::session::{AgentRegistry, CreateAgentOptions, MemoryStore, SendOptions};
use tandem_core::testing::{FakeProtocol, FakePtyBackend, FakeTreeKiller, RecordingNotifier};
use tandem_core::{TerminationOutcome, link};
use tokio::time::Instant;

struct Harness {
    registry: Arc<PtyRegistry>,
    backend: FakePtyBackend,
    notifier: RecordingNotifier,
    killer: FakeTreeKiller,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        let mut config = Config::default();
        config.pty.launch_delay_ms = 0;
        config.pty.shell = Some("/bin/sh".to_string());

        let backend = FakePtyBackend::new();
        let notifier = RecordingNotifier::new();
        let killer = FakeTreeKiller::new();
        let registry = PtyRegistry::new(
            &config,
            Arc::new(backend.clone()),
            Arc::new(notifier.clone()),
        )
        .with_tree_killer(Arc::new(killer.clone()));

        Self {
            registry: Arc::new(registry),
            backend,
            notifier,
            killer,
            config,
        }
    }

    fn create(&self, resume_id: Option<&str>) -> String {
        self.registry
            .create(CreatePtyOptions {
                title: Some("test".to_string()),
                cwd: PathBuf::from("/tmp"),
                resume_id: resume_id.map(str::to_string),
                ..Default::default()
            })
            .id
    }

    async fn started(&self) -> String {
        let id = self.create(None);
        self.registry.start(&id).await.unwrap();
        id
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_does_not_spawn() {
        let h = Harness::new();
        let id = h.create(None);
        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, PtyStatus::Starting);
        assert_eq!(view.visibility, Visibility::Foreground);
        assert!(h.backend.spawned().is_empty());
    }

    #[tokio::test]
    async fn test_start_spawns_shell_and_types_launch_command() {
        let h = Harness::new();
        let id = h.started().await;

        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, PtyStatus::Running);

        let process = h.backend.last().unwrap();
        assert_eq!(view.pid, Some(process.pid()));
        let request = process.request();
        assert_eq!(request.program, "/bin/sh");
        assert_eq!(request.cwd, PathBuf::from("/tmp"));
        assert_eq!(request.env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(process.written(), format!("{}\r", h.config.cli.program));
    }

    #[tokio::test]
    async fn test_launch_command_resumes() {
        let h = Harness::new();
        let id = h.create(Some("conv-1"));
        h.registry.start(&id).await.unwrap();
        let written = h.backend.last().unwrap().written();
        assert!(written.ends_with("--resume conv-1\r"), "{:?}", written);
    }

    #[tokio::test]
    async fn test_start_twice_is_a_conflict() {
        let h = Harness::new();
        let id = h.started().await;
        assert!(matches!(h.registry.start(&id).await, Err(Error::StateConflict(_))));
        assert!(matches!(h.registry.start("missing").await, Err(Error::UnknownSession(_))));
        assert_eq!(h.backend.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_error_status() {
        let h = Harness::new();
        h.backend.fail_spawn("no pty available");
        let id = h.create(None);

        h.registry.start(&id).await.unwrap();

        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, PtyStatus::Error);
        assert!(view.error.unwrap().contains("no pty available"));
        let statuses = h.notifier.on_channel("pty:status");
        assert!(matches!(
            statuses.last(),
            Some(Notification::PtyStatus { status: PtyStatus::Error, .. })
        ));
    }

    #[tokio::test]
    async fn test_output_and_exit_are_notified() {
        let h = Harness::new();
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        process.output("hello\r\n");
        process.exit(0);

        let output = h.notifier.on_channel("pty:output");
        assert!(matches!(
            &output[0],
            Notification::PtyOutput { data, .. } if data == "hello\r\n"
        ));
        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, PtyStatus::Exited);
        assert_eq!(view.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_write_and_resize_are_no_ops_after_exit() {
        let h = Harness::new();
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        h.registry.write_line(&id, "ls");
        h.registry.resize(&id, 100, 40);
        let written = process.written();
        assert!(written.ends_with("ls\r"));
        assert_eq!(process.sizes(), vec![(100, 40)]);

        process.exit(0);
        h.registry.write_line(&id, "pwd");
        h.registry.resize(&id, 80, 24);
        assert_eq!(process.written(), written);
        assert_eq!(process.sizes(), vec![(100, 40)]);

        // Unknown ids are silently ignored too
        h.registry.write("missing", b"x");
    }

    #[tokio::test]
    async fn test_focus_and_visibility() {
        let h = Harness::new();
        let id = h.started().await;

        h.registry.focus(&id).unwrap();
        assert_eq!(h.registry.focused().as_deref(), Some(id.as_str()));
        h.registry.set_visibility(&id, Visibility::Background).unwrap();
        assert_eq!(h.registry.get(&id).unwrap().visibility, Visibility::Background);
        assert!(h.registry.focus("missing").is_err());

        h.registry.close(&id, false).await;
        assert_eq!(h.registry.focused(), None);
    }
}

mod close_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_stops_after_first_interrupt() {
        let h = Harness::new();
        h.backend.exit_after_interrupts(Some(1));
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        let started = Instant::now();
        let outcome = h.registry.close(&id, true).await;

        assert_eq!(outcome, Some(TerminationOutcome::ExitedAfterFirstInterrupt));
        assert_eq!(process.interrupts(), 1);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert!(h.killer.killed().is_empty());
        assert!(h.registry.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_stops_after_second_interrupt() {
        let h = Harness::new();
        h.backend.exit_after_interrupts(Some(2));
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        let started = Instant::now();
        let outcome = h.registry.close(&id, true).await;

        assert_eq!(outcome, Some(TerminationOutcome::ExitedAfterSecondInterrupt));
        assert_eq!(process.interrupts(), 2);
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert!(h.killer.killed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_escalates_to_tree_kill() {
        let h = Harness::new();
        h.backend.exit_after_interrupts(None);
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        let outcome = h.registry.close(&id, true).await;

        assert_eq!(outcome, Some(TerminationOutcome::ForceKilled));
        assert_eq!(process.interrupts(), 2);
        assert_eq!(h.killer.killed(), vec![process.pid()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tree_kill_failure_falls_back_to_child_kill() {
        let h = Harness::new();
        h.killer.set_failing(true);
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        let outcome = h.registry.close(&id, false).await;

        assert_eq!(outcome, Some(TerminationOutcome::ForceKilled));
        assert_eq!(process.kills(), 1);
    }

    #[tokio::test]
    async fn test_forced_close_skips_interrupts() {
        let h = Harness::new();
        let id = h.started().await;
        let process = h.backend.last().unwrap();

        let outcome = h.registry.close(&id, false).await;

        assert_eq!(outcome, Some(TerminationOutcome::ForceKilled));
        assert_eq!(process.interrupts(), 0);
        assert_eq!(h.notifier.count("pty:closed"), 1);
    }

    #[tokio::test]
    async fn test_close_exited_process() {
        let h = Harness::new();
        let id = h.started().await;
        h.backend.last().unwrap().exit(0);

        let outcome = h.registry.close(&id, true).await;
        assert_eq!(outcome, Some(TerminationOutcome::AlreadyExited));
    }

    #[tokio::test]
    async fn test_close_twice_is_a_no_op() {
        let h = Harness::new();
        let id = h.started().await;

        assert!(h.registry.close(&id, false).await.is_some());
        assert!(h.registry.close(&id, false).await.is_none());
        assert_eq!(h.notifier.count("pty:closed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_all_escalates_one_session_at_a_time() {
        let h = Harness::new();
        h.backend.exit_after_interrupts(None);
        for _ in 0..2 {
            h.started().await;
        }

        let started = Instant::now();
        h.registry.close_all(true).await;

        let spawned = h.backend.spawned();
        let first = spawned[0].interrupted_at();
        let second = spawned[1].interrupted_at();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        // The second escalation starts only once the first was force-killed
        let (early, late) = if first[0] <= second[0] { (first, second) } else { (second, first) };
        assert!(late[0] - early[1] >= Duration::from_millis(1000));
        assert!(started.elapsed() >= Duration::from_millis(3000));
        assert_eq!(h.killer.killed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all() {
        let h = Harness::new();
        h.backend.exit_after_interrupts(Some(1));
        for _ in 0..3 {
            h.started().await;
        }

        h.registry.close_all(true).await;
        assert!(h.registry.is_empty());
        assert!(h.backend.spawned().iter().all(|p| p.interrupts() == 1));

        // Serial: each session is interrupted only after the previous one's
        // first wait has run out
        let mut first_interrupts: Vec<Instant> = h
            .backend
            .spawned()
            .iter()
            .map(|p| p.interrupted_at()[0])
            .collect();
        first_interrupts.sort();
        for pair in first_interrupts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }

        for _ in 0..2 {
            h.started().await;
        }
        h.registry.close_all(false).await;
        assert!(h.registry.is_empty());
        assert_eq!(h.notifier.count("pty:closed"), 5);
    }
}

mod guard_tests {
    use super::*;

    fn agent_registry(config: &Config) -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(
            config,
            Arc::new(FakeProtocol::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::new()),
        ))
    }

    #[tokio::test]
    async fn test_agent_resume_blocked_by_pty_session() {
        let h = Harness::new();
        let agents = agent_registry(&h.config);
        link(&h.registry, &agents);

        let pty_id = h.create(Some("conv-x"));
        h.registry.start(&pty_id).await.unwrap();
        let id = agents
            .create(CreateAgentOptions {
                cwd: Some(PathBuf::from("/tmp")),
                resume_id: Some("conv-x".to_string()),
                ..Default::default()
            })
            .id;

        let err = agents
            .send_message(&id, "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InUseByOtherMode(ref r) if r == "conv-x"));
        assert!(!agents.get(&id).unwrap().has_live_stream);
    }

    #[tokio::test]
    async fn test_pty_resume_blocked_by_agent_stream() {
        let h = Harness::new();
        let protocol = FakeProtocol::new();
        let agents = Arc::new(AgentRegistry::new(
            &h.config,
            Arc::new(protocol.clone()),
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingNotifier::new()),
        ));
        link(&h.registry, &agents);

        let agent_id = agents
            .create(CreateAgentOptions {
                cwd: Some(PathBuf::from("/tmp")),
                resume_id: Some("conv-y".to_string()),
                ..Default::default()
            })
            .id;
        agents
            .send_message(&agent_id, "hi", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(protocol.spawn_count(), 1);

        let id = h.create(Some("conv-y"));
        h.registry.start(&id).await.unwrap();

        let view = h.registry.get(&id).unwrap();
        assert_eq!(view.status, PtyStatus::Error);
        assert!(view.error.unwrap().contains("conv-y"));
        assert!(h.backend.spawned().is_empty());

        // Other conversations are unaffected
        let free = h.create(Some("conv-z"));
        h.registry.start(&free).await.unwrap();
        assert_eq!(h.registry.get(&free).unwrap().status, PtyStatus::Running);
    }

    #[tokio::test]
    async fn test_unstarted_pty_does_not_block() {
        let h = Harness::new();
        let agents = agent_registry(&h.config);
        link(&h.registry, &agents);

        let pty_id = h.create(Some("conv-v"));
        assert_eq!(h.registry.get(&pty_id).unwrap().status, PtyStatus::Starting);

        let id = agents
            .create(CreateAgentOptions {
                cwd: Some(PathBuf::from("/tmp")),
                resume_id: Some("conv-v".to_string()),
                ..Default::default()
            })
            .id;
        assert!(agents.send_message(&id, "hi", SendOptions::default()).await.is_ok());
        assert!(agents.get(&id).unwrap().has_live_stream);
    }

    #[tokio::test]
    async fn test_exited_pty_no_longer_blocks() {
        let h = Harness::new();
        let agents = agent_registry(&h.config);
        link(&h.registry, &agents);

        let pty_id = h.create(Some("conv-w"));
        h.registry.start(&pty_id).await.unwrap();
        h.backend.last().unwrap().exit(0);

        let id = agents
            .create(CreateAgentOptions {
                cwd: Some(PathBuf::from("/tmp")),
                resume_id: Some("conv-w".to_string()),
                ..Default::default()
            })
            .id;
        assert!(agents.send_message(&id, "hi", SendOptions::default()).await.is_ok());
    }
}
