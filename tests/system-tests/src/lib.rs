#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::ffi::OsString;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::process::Stdio;
    use std::sync::OnceLock;
    use std::time::Duration;

    use anyhow::{Context, Result, bail};
    use client_sdk::{ClientConfig, ConsulClient, ConsulError};
    use common::{AclToken, CheckOptions, CheckStatus, Event, KeyValuePair, ServiceOptions};
    use dev_agent::{AgentConfig, RunningAgent};
    use reqwest::StatusCode;
    use service_proxy::{ConsulService, ServiceProxy};
    use tokio::process::{Child, Command};
    use tokio::time::sleep;

    const MASTER_TOKEN: &str = "topSecret";
    const DC: &str = "test-dc";
    const DEFAULT_RULES: &str = r#"key "" { policy = "write" }"#;

    struct Fixture {
        agent: RunningAgent,
        master_client: ConsulClient,
        test_client: ConsulClient,
        test_token: String,
    }

    impl Fixture {
        fn proxy(&self) -> ServiceProxy {
            ConsulService::spawn(self.test_client.clone())
        }

        fn master_proxy(&self) -> ServiceProxy {
            ConsulService::spawn(self.master_client.clone())
        }

        fn stop(self) {
            self.master_client.close();
            self.test_client.close();
            self.agent.stop();
        }
    }

    fn config(addr: SocketAddr, token: &str) -> ClientConfig {
        ClientConfig::new(addr.ip().to_string(), addr.port())
            .with_acl_token(token)
            .with_dc(DC)
    }

    async fn start_agent() -> Result<Fixture> {
        let agent = dev_agent::start(AgentConfig {
            bind: "127.0.0.1:0".parse()?,
            ..AgentConfig::default()
                .with_datacenter(DC)
                .with_master_token(MASTER_TOKEN)
        })
        .await?;
        wait_for_url_status(&format!("{}/health", agent.base_url()), StatusCode::OK, 40).await?;

        let test_token = create_test_token(&agent.base_url()).await?;
        let master_client = ConsulClient::new(config(agent.addr, MASTER_TOKEN))?;
        let test_client = ConsulClient::new(config(agent.addr, &test_token))?;

        Ok(Fixture {
            agent,
            master_client,
            test_client,
            test_token,
        })
    }

    async fn create_test_token(base_url: &str) -> Result<String> {
        let created = reqwest::Client::new()
            .put(format!("{base_url}/v1/acl/create?token={MASTER_TOKEN}&dc={DC}"))
            .json(&serde_json::json!({ "Rules": DEFAULT_RULES }))
            .send()
            .await
            .context("failed to request test token")?
            .error_for_status()
            .context("agent refused to create test token")?
            .json::<serde_json::Value>()
            .await
            .context("failed to decode acl create response")?;

        created
            .get("ID")
            .and_then(|id| id.as_str())
            .map(ToString::to_string)
            .context("acl create response has no ID")
    }

    #[tokio::test]
    async fn kv_put_then_get_returns_same_pair() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        client.put_value("foo/bar", "value").await?;
        let pair = client.get_value("foo/bar").await?;
        assert_eq!(pair, KeyValuePair::new("foo/bar", "value"));

        client.put_value("foo/bar", "newer").await?;
        assert_eq!(client.get_value("foo/bar").await?.value, "newer");

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn kv_keys_with_reserved_url_characters_round_trip() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        let keys = ["odd/a#b", "odd/x?y", "odd/50%off", "odd/with space"];
        for key in keys {
            client.put_value(key, &format!("value of {key}")).await?;
        }
        for key in keys {
            let pair = client.get_value(key).await?;
            assert_eq!(pair, KeyValuePair::new(key, format!("value of {key}")));
        }

        let err = client.get_value("odd/a").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
        assert_eq!(client.get_values("odd/").await?.len(), keys.len());

        client.delete_value("odd/a#b").await?;
        assert!(client.get_value("odd/a#b").await.unwrap_err().is_not_found());
        assert_eq!(client.get_value("odd/x?y").await?.value, "value of odd/x?y");

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn event_and_check_names_with_reserved_characters() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        let fired = client.fire_event(&Event::named("deploy#1?")).await?;
        assert_eq!(fired.name, "deploy#1?");

        client
            .register_check(&CheckOptions::ttl("10s").with_id("db check#1").with_name("db"))
            .await?;
        client.pass_check("db check#1").await?;
        let status = client
            .local_checks()
            .await?
            .into_iter()
            .find(|check| check.id == "db check#1")
            .map(|check| check.status);
        assert_eq!(status, Some(CheckStatus::Passing));
        client.deregister_check("db check#1").await?;

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn kv_prefix_listing_returns_exactly_matching_keys() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        client.put_value("foo/bars1", "value1").await?;
        client.put_value("foo/bars2", "value2").await?;
        client.put_value("foo/other", "ignored").await?;

        let listed: HashSet<KeyValuePair> = client.get_values("foo/bars").await?.into_iter().collect();
        let expected: HashSet<KeyValuePair> = [
            KeyValuePair::new("foo/bars1", "value1"),
            KeyValuePair::new("foo/bars2", "value2"),
        ]
        .into_iter()
        .collect();
        assert_eq!(listed, expected);

        assert!(client.get_values("nothing/here").await?.is_empty());

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn deleted_key_is_not_found() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        client.put_value("foo/toDel", "value").await?;
        client.delete_value("foo/toDel").await?;

        let err = client.get_value("foo/toDel").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        client.delete_value("foo/toDel").await?;

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn delete_values_removes_the_whole_prefix() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        client.put_value("tree/a", "1").await?;
        client.put_value("tree/b/c", "2").await?;
        client.put_value("treetop", "3").await?;

        client.delete_values("tree/").await?;
        assert!(client.get_values("tree/").await?.is_empty());
        assert_eq!(client.get_value("treetop").await?.value, "3");

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn fired_event_is_listed_exactly_once() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        let fired = client
            .fire_event(&Event::named("custom-event").with_payload("content"))
            .await?;
        assert_eq!(fired.name, "custom-event");
        assert_eq!(fired.payload, "content");
        assert!(!fired.id.is_empty());

        let events = client.list_events().await?;
        let count = events.iter().filter(|event| event.id == fired.id).count();
        assert_eq!(count, 1);

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn service_with_ttl_check_registers_bound_check() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        let service = ServiceOptions::new("serviceName")
            .with_tags(["tag1", "tag2"])
            .with_check(CheckOptions::ttl("10s"))
            .with_address("10.0.0.1")
            .with_port(8080);
        client.register_service(&service).await?;

        let services = client.local_services().await?;
        let registered = services
            .iter()
            .find(|info| info.name == "serviceName")
            .context("registered service missing from local services")?;
        assert_eq!(registered.tags[1], "tag2");
        assert_eq!(registered.address, "10.0.0.1");
        assert_eq!(registered.port, 8080);

        let checks = client.local_checks().await?;
        let bound: Vec<_> = checks
            .iter()
            .filter(|check| check.service_name == "serviceName")
            .collect();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].id, "service:serviceName");

        client.pass_check("service:serviceName").await?;
        let status = client
            .local_checks()
            .await?
            .into_iter()
            .find(|check| check.id == "service:serviceName")
            .map(|check| check.status);
        assert_eq!(status, Some(CheckStatus::Passing));

        client.deregister_service("serviceName").await?;
        assert!(client.local_services().await?.is_empty());
        assert!(client.local_checks().await?.is_empty());

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn catalog_lookup_finds_agent_service() -> Result<()> {
        let fixture = start_agent().await?;

        let services = fixture.test_client.info_service("consul").await?;
        let count = services.iter().filter(|s| s.name == "consul").count();
        assert_eq!(count, 1);

        assert!(fixture.test_client.info_service("unknown").await?.is_empty());

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn check_update_output_then_deregister() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        let check = CheckOptions::ttl("10s").with_id("checkId").with_name("checkName");
        client.register_check(&check).await?;

        let registered = client
            .local_checks()
            .await?
            .into_iter()
            .find(|info| info.name == "checkName")
            .context("registered check missing")?;
        client
            .update_check(&registered.with_output("outputMessage"))
            .await?;

        let updated = client
            .local_checks()
            .await?
            .into_iter()
            .find(|info| info.name == "checkName")
            .context("updated check missing")?;
        assert_eq!(updated.output, "outputMessage");

        client.deregister_check(&updated.id).await?;
        assert!(client.local_checks().await?.is_empty());

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn ttl_transitions_change_status_and_unknown_ids_fail() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.test_client;

        client
            .register_check(&CheckOptions::ttl("10s").with_name("heartbeat"))
            .await?;

        let status_of = |checks: Vec<common::CheckInfo>| {
            checks
                .into_iter()
                .find(|check| check.id == "heartbeat")
                .map(|check| (check.status, check.output))
        };

        client.warn_check_with_note("heartbeat", "slow").await?;
        assert_eq!(
            status_of(client.local_checks().await?),
            Some((CheckStatus::Warning, "slow".to_string()))
        );

        client.fail_check("heartbeat").await?;
        assert_eq!(
            status_of(client.local_checks().await?).map(|(status, _)| status),
            Some(CheckStatus::Critical)
        );

        let err = client.pass_check("no-such-check").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        let err = client.deregister_check("no-such-check").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn acl_token_create_info_destroy() -> Result<()> {
        let fixture = start_agent().await?;
        let client = &fixture.master_client;

        let id = client.create_acl_token(&AclToken::default()).await?;
        let info = client.info_acl_token(&id).await?;
        assert_eq!(info.id, id);

        let listed = client.list_acl_tokens().await?;
        assert!(listed.iter().any(|token| token.id == id));
        assert!(listed.iter().any(|token| token.id == fixture.test_token));

        client.destroy_acl_token(&id).await?;
        let err = client.info_acl_token(&id).await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        let err = client.destroy_acl_token(&id).await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn client_token_cannot_manage_acls() -> Result<()> {
        let fixture = start_agent().await?;

        let err = fixture
            .test_client
            .create_acl_token(&AclToken::named("sneaky"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ConsulError::Rejected { status: 403, .. }),
            "{err:?}"
        );

        let anonymous = ConsulClient::new(
            ClientConfig::new(fixture.agent.addr.ip().to_string(), fixture.agent.addr.port())
                .with_dc(DC),
        )?;
        let err = anonymous.get_value("foo").await.unwrap_err();
        assert!(
            matches!(err, ConsulError::Rejected { status: 403, .. }),
            "{err:?}"
        );

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn unknown_datacenter_is_rejected_by_store() -> Result<()> {
        let fixture = start_agent().await?;

        let elsewhere = ConsulClient::new(
            config(fixture.agent.addr, MASTER_TOKEN).with_dc("other-dc"),
        )?;
        let err = elsewhere.list_events().await.unwrap_err();
        assert!(
            matches!(err, ConsulError::Rejected { status: 500, .. }),
            "{err:?}"
        );

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn closed_client_fails_every_operation() -> Result<()> {
        let fixture = start_agent().await?;
        let client = fixture.test_client.clone();

        client.put_value("before/close", "v").await?;
        client.close();

        assert_eq!(client.get_value("before/close").await, Err(ConsulError::Closed));
        assert_eq!(client.local_services().await, Err(ConsulError::Closed));
        assert_eq!(
            fixture.test_client.put_value("after/close", "v").await,
            Err(ConsulError::Closed)
        );

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn proxy_kv_calls_match_direct_client() -> Result<()> {
        let fixture = start_agent().await?;
        let proxy = fixture.proxy();

        proxy
            .put_value("foo/bars1".to_string(), "value1".to_string())
            .await?;
        proxy
            .put_value("foo/bars2".to_string(), "value2".to_string())
            .await?;

        let via_proxy = proxy.get_value("foo/bars1".to_string()).await?;
        let direct = fixture.test_client.get_value("foo/bars1").await?;
        assert_eq!(via_proxy, direct);

        let listed = proxy.get_values("foo/bars".to_string()).await?;
        assert_eq!(listed.len(), 2);

        proxy.delete_values("foo/".to_string()).await?;
        let err = proxy.get_value("foo/bars1".to_string()).await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn proxy_forwards_store_rejections_unchanged() -> Result<()> {
        let fixture = start_agent().await?;
        let proxy = fixture.proxy();
        let check = CheckOptions::ttl("5s")
            .with_name("orphan")
            .with_service_id("ghost");

        let direct = fixture.test_client.register_check(&check).await.unwrap_err();
        let proxied = proxy.register_check(check).await.unwrap_err();
        assert_eq!(proxied, direct);
        assert!(matches!(proxied, ConsulError::Rejected { status: 400, .. }));

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn proxy_covers_events_services_and_checks() -> Result<()> {
        let fixture = start_agent().await?;
        let proxy = fixture.proxy();

        let fired = proxy
            .fire_event(Event::named("deploy").with_payload("v2"))
            .await?;
        let events = proxy.list_events().await?;
        assert_eq!(events.iter().filter(|e| e.id == fired.id).count(), 1);

        proxy
            .register_service(
                ServiceOptions::new("web")
                    .with_port(80)
                    .with_check(CheckOptions::ttl("10s")),
            )
            .await?;
        let services = proxy.local_services().await?;
        assert_eq!(services.len(), 1);
        assert_eq!(proxy.info_service("web".to_string()).await?.len(), 1);

        proxy.warn_check("service:web".to_string()).await?;
        let checks = proxy.local_checks().await?;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, CheckStatus::Warning);

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn proxy_acl_lifecycle_and_close() -> Result<()> {
        let fixture = start_agent().await?;
        let proxy = fixture.master_proxy();

        let id = proxy.create_acl_token(AclToken::named("proxied")).await?;
        assert_eq!(proxy.info_acl_token(id.clone()).await?.name, "proxied");
        proxy.destroy_acl_token(id.clone()).await?;
        assert!(proxy.info_acl_token(id).await.unwrap_err().is_not_found());

        proxy.close();
        assert_eq!(proxy.list_acl_tokens().await, Err(ConsulError::Closed));
        assert!(fixture.master_client.is_closed());

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn proxy_call_sent_before_close_is_served() -> Result<()> {
        let fixture = start_agent().await?;
        fixture.test_client.put_value("k", "v").await?;
        let proxy = fixture.proxy();

        let (before, ()) = tokio::join!(proxy.get_value("k".to_string()), async {
            proxy.close()
        });
        assert_eq!(before?, KeyValuePair::new("k", "v"));

        assert_eq!(
            proxy.get_value("k".to_string()).await,
            Err(ConsulError::Closed)
        );

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_proxy_calls_all_complete() -> Result<()> {
        let fixture = start_agent().await?;
        let proxy = fixture.proxy();

        let mut tasks = Vec::new();
        for n in 0..20 {
            let proxy = proxy.clone();
            tasks.push(tokio::spawn(async move {
                proxy
                    .put_value(format!("burst/{n:02}"), n.to_string())
                    .await
            }));
        }
        for task in tasks {
            task.await??;
        }

        let listed = proxy.get_values("burst/".to_string()).await?;
        assert_eq!(listed.len(), 20);

        fixture.stop();
        Ok(())
    }

    #[tokio::test]
    async fn cli_put_then_get_against_agent_binary() -> Result<()> {
        let bind = "127.0.0.1:19580";
        let mut agent = start_agent_binary(bind).await?;

        let result = async {
            run_cli(&[
                "--port", "19580", "--token", MASTER_TOKEN, "--dc", DC, "put", "cli-roundtrip",
                "hello-from-cli",
            ])
            .await?;

            let output = run_cli(&[
                "--port", "19580", "--token", MASTER_TOKEN, "--dc", DC, "get", "cli-roundtrip",
            ])
            .await?;
            assert!(output.contains("hello-from-cli"));

            let output = run_cli(&[
                "--port",
                "19580",
                "--token",
                MASTER_TOKEN,
                "--dc",
                DC,
                "--via-proxy",
                "catalog",
                "consul",
            ])
            .await?;
            assert!(output.contains("\"name\": \"consul\""));

            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_child(&mut agent).await;
        result
    }

    #[tokio::test]
    async fn cli_reports_missing_key_as_failure() -> Result<()> {
        let bind = "127.0.0.1:19581";
        let mut agent = start_agent_binary(bind).await?;

        let result = run_cli(&[
            "--port", "19581", "--token", MASTER_TOKEN, "get", "missing-key",
        ])
        .await;

        stop_child(&mut agent).await;
        let err = result.err().context("expected cli to fail for a missing key")?;
        assert!(err.to_string().contains("not found"), "{err}");
        Ok(())
    }

    async fn start_agent_binary(bind: &str) -> Result<Child> {
        let agent_bin = binary_path("dev-agent")?;

        let child = Command::new(agent_bin)
            .env("CONSUL_DEV_BIND", bind)
            .env("CONSUL_DEV_DC", DC)
            .env("CONSUL_DEV_MASTER_TOKEN", MASTER_TOKEN)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn dev-agent")?;

        wait_for_url_status(&format!("http://{bind}/health"), StatusCode::OK, 40).await?;
        Ok(child)
    }

    async fn run_cli(args: &[&str]) -> Result<String> {
        let cli_bin = binary_path("consul-cli")?;
        let output = Command::new(cli_bin)
            .args(args)
            .env_remove("CONSUL_HOST")
            .env_remove("CONSUL_HTTP_TOKEN")
            .env_remove("CONSUL_DC")
            .output()
            .await
            .context("failed to execute consul-cli")?;

        if !output.status.success() {
            bail!(
                "consul-cli failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn wait_for_url_status(url: &str, expected: StatusCode, retries: usize) -> Result<()> {
        let http = reqwest::Client::new();

        for _ in 0..retries {
            if let Ok(resp) = http.get(url).send().await
                && resp.status() == expected
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }

        bail!("service did not return {expected} at {url}");
    }

    async fn stop_child(child: &mut Child) {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    fn binary_path(name: &str) -> Result<PathBuf> {
        let workspace_root = workspace_root()?;
        ensure_binaries_built(&workspace_root)?;
        let mut path = workspace_root.join("target").join("debug").join(name);

        if let Some(suffix) = std::env::consts::EXE_SUFFIX.strip_prefix('.') {
            let mut filename = OsString::from(name);
            filename.push(".");
            filename.push(suffix);
            path = workspace_root.join("target").join("debug").join(filename);
        }

        if !path.exists() {
            bail!("expected binary does not exist: {}", path.display());
        }

        Ok(path)
    }

    fn workspace_root() -> Result<PathBuf> {
        let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        crate_dir
            .parent()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .context("failed to resolve workspace root")
    }

    fn build_required_binaries(workspace_root: &PathBuf) -> Result<()> {
        let status = std::process::Command::new("cargo")
            .arg("build")
            .arg("-p")
            .arg("dev-agent")
            .arg("-p")
            .arg("cli-client")
            .current_dir(workspace_root)
            .status()
            .context("failed to run cargo build for system test binaries")?;

        if !status.success() {
            bail!("cargo build for system test binaries failed");
        }

        Ok(())
    }

    fn ensure_binaries_built(workspace_root: &PathBuf) -> Result<()> {
        static BUILD_RESULT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

        let result = BUILD_RESULT.get_or_init(|| {
            build_required_binaries(workspace_root).map_err(|err| err.to_string())
        });

        if let Err(message) = result {
            bail!("failed to build required binaries: {message}");
        }

        Ok(())
    }
}
