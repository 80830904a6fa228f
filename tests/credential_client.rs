use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;

use support::SERVICE_TOKEN;

const CLIENT: &str = env!("CARGO_BIN_EXE_devstack-credential-client");

fn run_client(dir: &Path, addr: &str, token: &str, extra: &[&str], script: &str) -> Output {
    client_command(dir, addr, token, extra, script)
        .output()
        .expect("run credential client")
}

fn client_command(dir: &Path, addr: &str, token: &str, extra: &[&str], script: &str) -> Command {
    let marker = dir.join("entrypoint.env");
    let mut command = Command::new(CLIENT);
    command
        .env_remove("VAULT_TOKEN")
        .env_remove("VAULT_TOKEN_FILE")
        .env_remove("DEVSTACK_SERVICE")
        .env_remove("DEVSTACK_CERT_DIR")
        .env("RUST_LOG", "info")
        .arg("--config")
        .arg(dir.join("absent.toml"))
        .args(["--service", "postgres"])
        .args(["--vault-addr", addr])
        .args(["--token", token])
        .args(["--retry-attempts", "2", "--retry-delay-ms", "10"])
        .arg("--runtime-dir")
        .arg(dir.join("run"))
        .args(extra)
        .args(["--", "sh", "-c", script])
        .arg(&marker);
    command
}

const WRITE_ENV: &str = r#"env > "$0"; printf '%s\n' "$@" > "$0.args""#;

fn marker(dir: &Path) -> std::path::PathBuf {
    dir.join("entrypoint.env")
}

#[tokio::test]
async fn tls_disabled_record_starts_entrypoint_with_credentials() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(false),
        1,
    )
    .await;

    let output = run_client(
        dir.path(),
        &server.uri(),
        SERVICE_TOKEN,
        &["--cert-dir", "/nonexistent/certs"],
        WRITE_ENV,
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let env = fs::read_to_string(marker(dir.path())).expect("entrypoint ran");
    assert!(env.contains("POSTGRES_USER=devuser"));
    assert!(env.contains("POSTGRES_PASSWORD=p4ssw0rd-from-the-kv-store-000000000000000"));
    assert!(env.contains("POSTGRES_DB=dev_database"));
    assert!(env.contains("DEVSTACK_TLS_ENABLED=false"));
    let args = fs::read_to_string(dir.path().join("entrypoint.env.args")).expect("args");
    assert!(!args.contains("ssl=on"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("p4ssw0rd-from-the-kv-store"));
}

#[tokio::test]
async fn tls_enabled_record_passes_certificate_paths_in_supervise_mode() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    let certs = dir.path().join("certs");
    let bundle = support::write_bundle(&certs, "postgres", 0o600);
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        json!({
            "user": "devuser",
            "password": "p4ssw0rd-from-the-kv-store-000000000000000",
            "tls_enabled": "true"
        }),
        2,
    )
    .await;

    let cert_dir = certs.to_string_lossy().to_string();
    let output = run_client(
        dir.path(),
        &server.uri(),
        SERVICE_TOKEN,
        &["--cert-dir", &cert_dir, "--handoff", "supervise"],
        &format!("{WRITE_ENV}; exit 3"),
    );
    assert_eq!(output.status.code(), Some(3));

    let env = fs::read_to_string(marker(dir.path())).expect("entrypoint ran");
    assert!(env.contains("DEVSTACK_TLS_ENABLED=true"));
    let args = fs::read_to_string(dir.path().join("entrypoint.env.args")).expect("args");
    assert!(args.contains("ssl=on"));
    assert!(args.contains(&format!("ssl_cert_file={}", bundle.cert.display())));
}

#[tokio::test]
async fn unreachable_backend_exits_69_without_running_entrypoint() {
    let dir = tempdir().expect("tempdir");
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = format!("http://{}", listener.local_addr().expect("addr"));
    drop(listener);

    let output = run_client(dir.path(), &addr, SERVICE_TOKEN, &[], WRITE_ENV);
    assert_eq!(output.status.code(), Some(69));
    assert!(!marker(dir.path()).exists());
}

#[tokio::test]
async fn loose_certificate_mode_exits_77() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    let certs = dir.path().join("certs");
    support::write_bundle(&certs, "postgres", 0o644);
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(true),
        1,
    )
    .await;

    let cert_dir = certs.to_string_lossy().to_string();
    let output = run_client(
        dir.path(),
        &server.uri(),
        SERVICE_TOKEN,
        &["--cert-dir", &cert_dir],
        WRITE_ENV,
    );
    assert_eq!(output.status.code(), Some(77));
    assert!(!marker(dir.path()).exists());
}

#[tokio::test]
async fn missing_certificate_exits_66() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(true),
        1,
    )
    .await;

    let cert_dir = dir.path().join("empty").to_string_lossy().to_string();
    let output = run_client(
        dir.path(),
        &server.uri(),
        SERVICE_TOKEN,
        &["--cert-dir", &cert_dir],
        WRITE_ENV,
    );
    assert_eq!(output.status.code(), Some(66));
    assert!(!marker(dir.path()).exists());
}

#[tokio::test]
async fn short_token_exits_78_without_requests() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");

    let output = run_client(dir.path(), &server.uri(), "hvs.short", &[], WRITE_ENV);
    assert_eq!(output.status.code(), Some(78));
    assert!(
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .is_empty()
    );
    assert!(!marker(dir.path()).exists());
}

#[tokio::test]
async fn missing_record_exits_66() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    support::stub_kv_missing(&server, SERVICE_TOKEN, "secret", "postgres").await;

    let output = run_client(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV);
    assert_eq!(output.status.code(), Some(66));
}

#[tokio::test]
async fn malformed_record_exits_65_without_echoing_values() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        json!({ "user": "devuser", "password": "leaky-value-0000000000", "tls_enabled": "maybe" }),
        1,
    )
    .await;

    let output = run_client(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV);
    assert_eq!(output.status.code(), Some(65));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("leaky-value"));
}

#[tokio::test]
async fn sealed_backend_exits_75_after_polling() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 503).await;

    let output = run_client(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV);
    assert_eq!(output.status.code(), Some(75));
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn uninitialized_backend_exits_75_immediately() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 501).await;

    let output = run_client(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV);
    assert_eq!(output.status.code(), Some(75));
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn server_error_on_record_read_is_retried() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/postgres"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(false),
        1,
    )
    .await;

    let output = run_client(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let env = fs::read_to_string(marker(dir.path())).expect("entrypoint ran");
    assert!(env.contains("POSTGRES_USER=devuser"));
}

#[tokio::test]
async fn record_read_timeout_exits_69() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/postgres"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "data": support::postgres_record(false) } }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let output = client_command(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV)
        .env("DEVSTACK_CLIENT_REQUEST_TIMEOUT_SECS", "1")
        .output()
        .expect("run credential client");
    assert_eq!(output.status.code(), Some(69));
    assert!(!marker(dir.path()).exists());
}

#[tokio::test]
async fn required_tls_rejects_plaintext_record() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(false),
        1,
    )
    .await;

    let output = run_client(
        dir.path(),
        &server.uri(),
        SERVICE_TOKEN,
        &["--require-tls"],
        WRITE_ENV,
    );
    assert_eq!(output.status.code(), Some(65));
    assert!(!marker(dir.path()).exists());
    assert!(String::from_utf8_lossy(&output.stderr).contains("requires TLS"));
}

#[tokio::test]
async fn entrypoint_does_not_inherit_backend_token() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    let token_file = dir.path().join("token");
    fs::write(&token_file, SERVICE_TOKEN).expect("token file");
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(false),
        1,
    )
    .await;

    let output = client_command(dir.path(), &server.uri(), SERVICE_TOKEN, &[], WRITE_ENV)
        .env("VAULT_TOKEN", SERVICE_TOKEN)
        .env("VAULT_TOKEN_FILE", &token_file)
        .output()
        .expect("run credential client");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let env = fs::read_to_string(marker(dir.path())).expect("entrypoint ran");
    assert!(!env.contains("VAULT_TOKEN"));
    assert!(!env.contains(SERVICE_TOKEN));
}

#[tokio::test]
async fn supervise_forwards_sigterm_to_entrypoint() {
    let server = MockServer::start().await;
    let dir = tempdir().expect("tempdir");
    support::stub_health(&server, 200).await;
    support::stub_kv_record(
        &server,
        SERVICE_TOKEN,
        "secret",
        "postgres",
        support::postgres_record(false),
        1,
    )
    .await;

    let script = r#"trap 'exit 9' TERM; env > "$0"; while :; do sleep 0.05; done"#;
    let mut child = client_command(
        dir.path(),
        &server.uri(),
        SERVICE_TOKEN,
        &["--handoff", "supervise"],
        script,
    )
    .spawn()
    .expect("spawn credential client");

    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker(dir.path()).exists() {
        assert!(Instant::now() < deadline, "entrypoint never started");
        std::thread::sleep(Duration::from_millis(20));
    }
    let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid fits"));
    kill(pid, Signal::SIGTERM).expect("signal client");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().expect("wait client") {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("client did not exit after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(status.code(), Some(9));
}
