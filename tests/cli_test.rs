//! Command Line Tests
//!
//! Runs the `wcs-uploadr` binary.
//!
//! ## Test Coverage
//!
//! - Help output lists the subcommands
//! - Missing or invalid upload domain is rejected
//! - `status` and `forget` against an empty record directory
//! - `upload` against a mocked endpoint prints the object descriptor

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_config(dir: &Path, put_domain: &str) -> std::path::PathBuf {
        let config = dir.join("config.yaml");
        std::fs::write(
            &config,
            format!(
                "endpoint:\n  put_domain: \"{}\"\nupload:\n  block_size: 8\n  chunk_size: 8\n  retry_backoff_millis: 0\nrecord:\n  dir: \"{}\"\n",
                put_domain,
                dir.join("records").display()
            ),
        )
        .unwrap();
        config
    }

    fn ctx(value: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ctx": value }))
    }

    fn cli() -> Command {
        let mut cmd = Command::cargo_bin("wcs-uploadr").unwrap();
        cmd.env_remove("WCS_PUT_DOMAIN")
            .env_remove("WCS_UPLOAD_TOKEN")
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn test_help_lists_subcommands() {
        cli()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("upload"))
            .stdout(predicate::str::contains("status"))
            .stdout(predicate::str::contains("forget"));
    }

    #[test]
    fn test_missing_put_domain_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"payload").unwrap();

        cli()
            .arg("status")
            .arg(&file)
            .assert()
            .failure()
            .stderr(predicate::str::contains("--put-domain"));
    }

    #[test]
    fn test_invalid_put_domain_fails() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"payload").unwrap();

        cli()
            .args(["--put-domain", "ftp://example.com", "status"])
            .arg(&file)
            .assert()
            .failure();
    }

    // ========================================================================
    // TEST: Record Commands
    // ========================================================================

    #[test]
    fn test_status_without_record() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), "http://localhost:9");
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"payload").unwrap();

        cli()
            .arg("--config")
            .arg(&config)
            .arg("status")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("No recorded upload for"));
    }

    #[test]
    fn test_forget_without_record() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), "http://localhost:9");
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"payload").unwrap();

        cli()
            .arg("--config")
            .arg(&config)
            .arg("forget")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("Forgot recorded progress"));
    }

    #[test]
    fn test_status_of_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), "http://localhost:9");

        cli()
            .arg("--config")
            .arg(&config)
            .arg("status")
            .arg(dir.path().join("absent.bin"))
            .assert()
            .failure();
    }

    // ========================================================================
    // TEST: Upload
    // ========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_prints_descriptor() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), &server.uri());
        let file = dir.path().join("report.csv");
        std::fs::write(&file, b"a,b,c\n1,2,3\n").unwrap();

        Mock::given(method("POST"))
            .and(path("/mkblk/8/0"))
            .respond_with(ctx("c0"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mkblk/4/1"))
            .respond_with(ctx("c1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mkfile/12"))
            .and(body_string("c0,c1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"hash": "FvQ1", "key": "report.csv"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let assert = tokio::task::spawn_blocking(move || {
            cli()
                .arg("--config")
                .arg(&config)
                .arg("upload")
                .arg(&file)
                .args(["--token", "ak:sig:policy", "--mime-type", "text/csv"])
                .assert()
        })
        .await
        .unwrap();

        assert
            .success()
            .stdout(predicate::str::contains("\"hash\": \"FvQ1\""))
            .stdout(predicate::str::contains("\"key\": \"report.csv\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upload_rejected_fails_and_keeps_record() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path(), &server.uri());
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"0123456789abcdef").unwrap();

        Mock::given(method("POST"))
            .and(path("/mkblk/8/0"))
            .respond_with(ctx("c0"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mkblk/8/1"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let upload_config = config.clone();
        let upload_file = file.clone();
        let assert = tokio::task::spawn_blocking(move || {
            cli()
                .arg("--config")
                .arg(&upload_config)
                .args(["upload", "--token", "expired"])
                .arg(&upload_file)
                .assert()
        })
        .await
        .unwrap();

        assert
            .failure()
            .stderr(predicate::str::contains("status 401"));

        cli()
            .arg("--config")
            .arg(&config)
            .arg("status")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("50.00% (8 of 16 bytes, 1 of 2 blocks)"));
    }
}
