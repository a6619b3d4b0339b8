use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

fn payrecon() -> Command {
    let mut cmd = Command::new(cargo_bin!("payrecon"));
    cmd.env_remove("PAYRECON_API_KEY").env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_report() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = payrecon();
    cmd.arg("--orders").arg("tests/fixtures/orders.csv").arg("report");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "id,status,payment_status,processing_completed,tx_id,transient_error_code,hard_error_code",
        ))
        .stdout(predicate::str::contains("1001,complete,,no,,,"))
        .stdout(predicate::str::contains("1002,pending,,no,,,"))
        .stdout(predicate::str::contains("1003,canceled,,no,,,"));

    Ok(())
}

#[test]
fn test_cli_report_skips_malformed_rows() -> Result<(), Box<dyn std::error::Error>> {
    let mut csv = tempfile::NamedTempFile::new()?;
    writeln!(csv, "id,grand_total,currency,status,updated_at")?;
    writeln!(csv, "1,ten,USD,pending,2026-04-01T10:00:00Z")?;
    writeln!(csv, "2,10,USD,pending,2026-04-01T10:00:00Z")?;

    let mut cmd = payrecon();
    cmd.arg("--orders").arg(csv.path()).arg("report");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("2,pending,,no,,,"))
        .stdout(predicate::str::contains("1,pending").not())
        .stderr(predicate::str::contains("Error reading order"));

    Ok(())
}

#[test]
fn test_cli_tick_requires_api_key() {
    let mut cmd = payrecon();
    cmd.arg("--orders")
        .arg("tests/fixtures/orders.csv")
        .arg("tick")
        .arg("orders");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("no provider API key configured"));
}

#[test]
fn test_cli_callback_requires_api_key() {
    let mut cmd = payrecon();
    cmd.arg("--orders")
        .arg("tests/fixtures/orders.csv")
        .args(["callback", "1002", "--id", "1002"])
        .args(["--hmac-alg", "HMAC-SHA256-HEX", "--hmac-input", "aWQ9MTAwMg=="])
        .args(["--hmac-key-id", "v1", "--hmac-value", "abc"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("no provider API key configured"));
}

#[test]
fn test_cli_callback_for_other_session_is_rejected() {
    let mut cmd = payrecon();
    cmd.env("PAYRECON_API_KEY", "test-key")
        .arg("--orders")
        .arg("tests/fixtures/orders.csv")
        .args(["callback", "1001", "--id", "1002"])
        .args(["--hmac-alg", "HMAC-SHA256-HEX", "--hmac-input", "aWQ9MTAwMg=="])
        .args(["--hmac-key-id", "v1", "--hmac-value", "abc"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::diff("rejected\n"));
}

#[test]
fn test_cli_cancel_needs_no_provider() {
    let mut cmd = payrecon();
    cmd.arg("--orders")
        .arg("tests/fixtures/orders.csv")
        .arg("cancel")
        .arg("1002");

    cmd.assert().success();
}

#[test]
fn test_cli_unblock_unknown_order() {
    let mut cmd = payrecon();
    cmd.arg("unblock").arg("missing");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Order not found: missing"));
}

#[test]
fn test_cli_rejects_bad_config() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = tempfile::NamedTempFile::new()?;
    writeln!(config, "[sync]\nretry_ceiling = \"three\"")?;

    let mut cmd = payrecon();
    cmd.arg("--config").arg(config.path()).arg("report");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));

    Ok(())
}
