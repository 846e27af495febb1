    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use botkernel_config::InstallerConfig;
    use botkernel_protocols::Nonce;

    use crate::installer::CommandInstaller;

    const WAIT: Duration = Duration::from_secs(5);

    fn handshake() -> Envelope {
        Envelope::Handshake {
            id: "1".to_string(),
            protocol_version: "1".to_string(),
            config: json!({"k": "v"}),
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Envelope {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Some(TransportEvent::Message(env))) => env,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    fn factory(workers: WorkerRegistry) -> DefaultTransportFactory {
        DefaultTransportFactory::new(
            Arc::new(workers),
            Arc::new(CommandInstaller::new(InstallerConfig::default())),
            Duration::from_secs(1),
        )
    }

    fn manifest(value: serde_json::Value) -> ModuleManifest {
        ModuleManifest::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_worker_transport_echo() {
        let TransportHandle {
            transport,
            mut events,
        } = WorkerTransport::spawn("1", Box::new(EchoWorker::new("echo")), WAIT);
        assert_eq!(transport.protocol(), CommProtocol::Worker);

        transport.send(handshake());
        match next_message(&mut events).await {
            Envelope::HandshakeSuccess {
                module_namespace, ..
            } => assert_eq!(module_namespace, "echo"),
            other => panic!("unexpected {:?}", other),
        }

        transport.send(Envelope::ApiCall {
            call_from: "core".to_string(),
            call_cmd: "echo".to_string(),
            data: json!({"x": 1}),
            nonce: Nonce::Seq(5),
        });
        assert_eq!(
            next_message(&mut events).await,
            Envelope::ApiSendResponse {
                response_to: "core".to_string(),
                exist: true,
                data: json!({"x": 1}),
                error: None,
                nonce: Nonce::Seq(5),
            }
        );

        transport.kill().await;
        assert!(transport.is_killed());
        // Killing twice is harmless and sending afterwards is ignored.
        transport.kill().await;
        transport.send(handshake());
    }

    struct PanickingWorker;

    #[async_trait]
    impl WorkerModule for PanickingWorker {
        async fn run(self: Box<Self>, mut ctx: WorkerContext) -> WorkerResult {
            ctx.recv().await;
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_worker_panic_reported() {
        let TransportHandle {
            transport,
            mut events,
        } = WorkerTransport::spawn("2", Box::new(PanickingWorker), WAIT);
        transport.send(handshake());
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(TransportEvent::Error("worker panicked".to_string()))
        );
    }

    struct StubbornWorker;

    #[async_trait]
    impl WorkerModule for StubbornWorker {
        async fn run(self: Box<Self>, _ctx: WorkerContext) -> WorkerResult {
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_worker_kill_aborts_after_grace() {
        let handle = WorkerTransport::spawn(
            "3",
            Box::new(StubbornWorker),
            Duration::from_millis(50),
        );
        tokio::time::timeout(WAIT, handle.transport.kill())
            .await
            .expect("kill returns after the grace window");
    }

    #[test]
    fn test_worker_registry() {
        let registry = WorkerRegistry::new();
        registry.register("echo", || Box::new(EchoWorker::new("echo")));
        assert!(registry.create("echo").is_some());
        assert!(registry.create("missing").is_none());
    }

    #[test]
    fn test_resolve_program() {
        let dir = Path::new("/srv/module");
        assert_eq!(resolve_program(dir, "node"), PathBuf::from("node"));
        assert_eq!(
            resolve_program(dir, "./bin/run"),
            PathBuf::from("/srv/module/./bin/run")
        );
        assert_eq!(resolve_program(dir, "/usr/bin/env"), PathBuf::from("/usr/bin/env"));
    }

    #[tokio::test]
    async fn test_factory_unknown_worker() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest(json!({
            "namespace": "ghost",
            "autoRestart": false,
            "type": "script",
            "communicationProtocol": "node_worker",
            "scriptSrc": "ghost"
        }));
        let result = factory(WorkerRegistry::new())
            .spawn(SpawnRequest {
                module_id: "1",
                manifest: &manifest,
                work_dir: dir.path(),
            })
            .await;
        assert!(matches!(result, Err(KernelError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_factory_rejects_incompatible_pair() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest(json!({
            "namespace": "pkg",
            "autoRestart": false,
            "type": "package",
            "communicationProtocol": "node_worker"
        }));
        let result = factory(WorkerRegistry::new())
            .spawn(SpawnRequest {
                module_id: "1",
                manifest: &manifest,
                work_dir: dir.path(),
            })
            .await;
        assert!(matches!(result, Err(KernelError::UnsupportedTransport { .. })));
    }

    #[tokio::test]
    async fn test_factory_package_requires_command() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest(json!({
            "namespace": "pkg",
            "autoRestart": false,
            "type": "package",
            "communicationProtocol": "msgpack"
        }));
        let result = factory(WorkerRegistry::new())
            .spawn(SpawnRequest {
                module_id: "1",
                manifest: &manifest,
                work_dir: dir.path(),
            })
            .await;
        assert!(matches!(result, Err(KernelError::Configuration(_))));
    }

    #[cfg(unix)]
    fn cat_command(dir: &Path) -> ProcessCommand {
        ProcessCommand {
            module_id: "7".to_string(),
            program: PathBuf::from("cat"),
            args: Vec::new(),
            cwd: dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_loopback() {
        let dir = TempDir::new().unwrap();
        let TransportHandle {
            transport,
            mut events,
        } = IpcTransport::spawn(&cat_command(dir.path()), Duration::from_secs(1)).unwrap();
        assert_eq!(transport.protocol(), CommProtocol::Ipc);

        transport.send(handshake());
        transport.send(Envelope::Challenge {
            challenge: "abc".to_string(),
        });
        assert_eq!(next_message(&mut events).await, handshake());
        assert_eq!(
            next_message(&mut events).await,
            Envelope::Challenge {
                challenge: "abc".to_string()
            }
        );

        tokio::time::timeout(WAIT, transport.kill()).await.unwrap();
        assert!(transport.is_killed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let command = ProcessCommand {
            module_id: "8".to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "echo not-json; exit 4".to_string()],
            cwd: dir.path().to_path_buf(),
        };
        let TransportHandle { mut events, .. } =
            IpcTransport::spawn(&command, Duration::from_secs(1)).unwrap();

        // The garbage line is dropped; only the exit is reported.
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
        assert_eq!(event, Some(TransportEvent::Exited(Some(4))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_survives_multibyte_garbage_line() {
        let _log = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::WARN)
                .with_test_writer()
                .finish(),
        );
        let dir = TempDir::new().unwrap();
        let script = format!(
            "printf '%s\\n' '{}é'; echo '{{\"type\":\"challenge_response\",\"challenge\":\"ok\"}}'; sleep 5",
            "a".repeat(199)
        );
        let command = ProcessCommand {
            module_id: "9".to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script],
            cwd: dir.path().to_path_buf(),
        };
        let TransportHandle {
            transport,
            mut events,
        } = IpcTransport::spawn(&command, Duration::from_secs(1)).unwrap();

        assert_eq!(
            next_message(&mut events).await,
            Envelope::ChallengeResponse {
                challenge: "ok".to_string()
            }
        );
        transport.kill().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_loopback() {
        let dir = TempDir::new().unwrap();
        let TransportHandle {
            transport,
            mut events,
        } = StdioTransport::spawn(&cat_command(dir.path())).unwrap();
        assert_eq!(transport.protocol(), CommProtocol::Stdio);

        let call = Envelope::ApiSend {
            call_to: "core".to_string(),
            call_cmd: "get_operator_list".to_string(),
            data: json!({}),
            nonce: Nonce::Id("7-x".to_string()),
        };
        transport.send(call.clone());
        assert_eq!(next_message(&mut events).await, call);

        transport.kill().await;
        let exit = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
        assert!(matches!(exit, Some(TransportEvent::Exited(_))) || exit.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_factory_script_ipc_with_runtime() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.sh"), "exec cat\n").unwrap();
        let manifest = manifest(json!({
            "namespace": "shell",
            "autoRestart": false,
            "type": "script",
            "communicationProtocol": "node_ipc",
            "scriptSrc": "main.sh",
            "runtime": "sh"
        }));
        let TransportHandle {
            transport,
            mut events,
        } = factory(WorkerRegistry::new())
            .spawn(SpawnRequest {
                module_id: "9",
                manifest: &manifest,
                work_dir: dir.path(),
            })
            .await
            .unwrap();

        transport.send(handshake());
        assert_eq!(next_message(&mut events).await, handshake());
        transport.kill().await;
    }
