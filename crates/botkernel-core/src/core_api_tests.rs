    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn kernel() -> (TempDir, Kernel) {
        let dir = TempDir::new().unwrap();
        let kernel = Kernel::new(dir.path());
        (dir, kernel)
    }

    async fn run(kernel: &Kernel, caller: &str, command: &str, data: Value) -> Value {
        kernel
            .handle_core_command(caller, command, data)
            .await
            .unwrap()
            .expect("known command")
            .0
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (_dir, kernel) = kernel();
        let result = kernel
            .handle_core_command("1", "does_not_exist", Value::Null)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_event_hooks() {
        let (_dir, kernel) = kernel();
        let hook = json!({"eventName": "message", "callbackFunction": "on_message"});

        let reply = run(&kernel, "1", "register_event_hook", hook.clone()).await;
        assert_eq!(reply, json!({"success": true}));
        assert_eq!(kernel.inner.events.subscribers("message").len(), 1);

        let reply = run(&kernel, "1", "send_event", json!({"eventName": "message", "data": 1})).await;
        assert_eq!(reply, json!({"hasSubscribers": true}));

        let reply = run(&kernel, "1", "unregister_event_hook", hook.clone()).await;
        assert_eq!(reply, json!({"success": true}));
        let reply = run(&kernel, "1", "unregister_event_hook", hook).await;
        assert_eq!(reply, json!({"success": false}));

        let reply = run(&kernel, "1", "send_event", json!({"eventName": "message"})).await;
        assert_eq!(reply, json!({"hasSubscribers": false}));
    }

    #[tokio::test]
    async fn test_plugin_registration() {
        let (_dir, kernel) = kernel();
        let plugin = json!({
            "pluginName": "Ping",
            "namespace": "ping",
            "version": "1.0.0",
            "author": "ops",
        });

        let reply = run(&kernel, "2", "register_plugin", plugin.clone()).await;
        assert_eq!(reply, json!({"conflict": false}));
        let reply = run(&kernel, "3", "register_plugin", plugin).await;
        assert_eq!(reply, json!({"conflict": true}));

        let info = run(&kernel, "9", "get_plugin_namespace_info", json!({"namespace": "ping"})).await;
        assert_eq!(info["exist"], json!(true));
        assert_eq!(info["pluginName"], json!("Ping"));
        assert_eq!(info["resolver"], json!("2"));

        let reply = run(&kernel, "2", "unregister_plugin", json!({"namespace": "ping"})).await;
        assert_eq!(reply, json!({"success": true}));
        let info = run(&kernel, "9", "get_plugin_namespace_info", json!({"namespace": "ping"})).await;
        assert_eq!(info, json!({"exist": false}));
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let (_dir, kernel) = kernel();
        let result = kernel
            .handle_core_command("1", "register_event_hook", json!({"eventName": 5}))
            .await;
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));

        let result = kernel
            .handle_core_command("1", "pnpm_install_specific", json!({"path": "/tmp"}))
            .await;
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_prompt_without_host_uses_default() {
        let (_dir, kernel) = kernel();
        let reply = run(
            &kernel,
            "1",
            "prompt",
            json!({"promptInfo": "Continue?", "promptType": "yes-no", "defaultValue": true}),
        )
        .await;
        assert_eq!(reply, json!({"data": true}));

        let result = kernel
            .handle_core_command("1", "prompt", json!({"promptInfo": "Name?"}))
            .await;
        assert!(matches!(result, Err(ApiError::Failed(_))));
    }

    #[tokio::test]
    async fn test_database_lookup_without_default() {
        let (_dir, kernel) = kernel();
        let result = kernel
            .handle_core_command("1", "get_default_db", Value::Null)
            .await;
        assert!(matches!(result, Err(ApiError::Failed(_))));

        kernel.inner.databases.insert(3, "4");
        kernel.inner.databases.set_default(3);
        let reply = run(&kernel, "1", "get_db_resolver", Value::Null).await;
        assert_eq!(reply, json!({"databaseID": 3, "resolver": "4"}));
        let reply = run(&kernel, "1", "wait_for_default_db", Value::Null).await;
        assert!(reply.is_null());
    }

    #[tokio::test]
    async fn test_persistent_data_requires_known_caller() {
        let (_dir, kernel) = kernel();
        let result = kernel
            .handle_core_command("1", "set_persistent_data", json!({"a": 1}))
            .await;
        assert!(matches!(result, Err(ApiError::Failed(_))));
    }

    #[tokio::test]
    async fn test_follow_ups_and_plain_values() {
        let (_dir, kernel) = kernel();
        let (value, follow_up) = kernel
            .handle_core_command("1", "kill", Value::Null)
            .await
            .unwrap()
            .unwrap();
        assert!(value.is_null());
        assert_eq!(follow_up, Some(FollowUp::StopCaller));

        let (_, follow_up) = kernel
            .handle_core_command("1", "restart_core", Value::Null)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(follow_up, Some(FollowUp::Restart));

        let operators = run(&kernel, "1", "get_operator_list", Value::Null).await;
        assert_eq!(operators, json!([]));

        let modules = run(&kernel, "1", "get_registered_modules", Value::Null).await;
        assert_eq!(modules[0]["moduleID"], json!("core"));

        let logged = run(
            &kernel,
            "1",
            "log",
            json!({"level": "warn", "data": ["disk", 93, "%"], "namespace": "monitor"}),
        )
        .await;
        assert!(logged.is_null());
    }

    #[tokio::test]
    async fn test_install_failure_is_reported_in_data() {
        let dir = TempDir::new().unwrap();
        let kernel = Kernel::builder(dir.path())
            .installer(Arc::new(crate::installer::CommandInstaller::new(
                botkernel_config::InstallerConfig {
                    program: "botkernel-missing-installer".to_string(),
                    install_args: vec![],
                    add_args: vec![],
                },
            )))
            .build();
        let reply = run(
            &kernel,
            "1",
            "pnpm_install",
            json!({"path": dir.path().to_string_lossy()}),
        )
        .await;
        assert_eq!(reply["success"], json!(false));
        assert!(reply["error"].is_string());
    }
