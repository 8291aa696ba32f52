//! Command-line tests against the built binary.

mod common;

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use tofu_broker::brokerpak::packer::archive_dir;
use tofu_broker::brokerpak::Manifest;

fn broker_cmd(db_dir: &Path) -> Command {
    let mut cmd = assert_cmd::cargo_bin_cmd!("tofu-broker");
    cmd.env("NO_COLOR", "1")
        .env("DB_PATH", db_dir.join("broker.sqlite3"))
        .env_remove("DB_TYPE")
        .env_remove("ENCRYPTION_ENABLED")
        .env_remove("ENCRYPTION_PASSWORDS")
        .env_remove("CF_INSTANCE_GUID");
    cmd
}

/// A pak with the test offering and no binaries.
fn write_pak(dir: &Path) -> std::path::PathBuf {
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    let mut manifest = Manifest::example();
    manifest.service_definitions = vec!["csb-test-db.yml".into()];
    std::fs::write(src.join("manifest.yml"), manifest.to_yaml().unwrap()).unwrap();
    std::fs::write(src.join("csb-test-db.yml"), common::DEFINITION).unwrap();

    let pak = dir.join("test.brokerpak");
    archive_dir(&src, &pak).unwrap();
    pak
}

#[test]
fn test_help_lists_commands() {
    let tmp = TempDir::new().unwrap();
    broker_cmd(tmp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("pak"))
        .stdout(predicate::str::contains("purge-binding"))
        .stdout(predicate::str::contains("tf"));
}

#[test]
fn test_pak_init_writes_skeleton() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("my-pak");

    broker_cmd(tmp.path())
        .args(["pak", "init"])
        .arg(&dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized brokerpak skeleton"));
    assert!(dir.join("manifest.yml").exists());
    assert!(dir.join("example-provision.tf").exists());

    broker_cmd(tmp.path())
        .args(["pak", "init"])
        .arg(&dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_pak_info_and_docs() {
    let tmp = TempDir::new().unwrap();
    let pak = write_pak(tmp.path());

    broker_cmd(tmp.path())
        .args(["pak", "info"])
        .arg(&pak)
        .assert()
        .success()
        .stdout(predicate::str::contains("my-services-pack"))
        .stdout(predicate::str::contains(common::SERVICE_ID))
        .stdout(predicate::str::contains("small, subsume"))
        .stdout(predicate::str::contains("csb-test-db.yml"));

    broker_cmd(tmp.path())
        .args(["pak", "docs"])
        .arg(&pak)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("# Service Offerings"))
        .stdout(predicate::str::contains("Service Name: `csb-test-db`"));
}

#[test]
fn test_pak_validate_missing_file_fails() {
    let tmp = TempDir::new().unwrap();
    broker_cmd(tmp.path())
        .args(["pak", "validate"])
        .arg(tmp.path().join("missing.brokerpak"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("✗"));
}

#[test]
fn test_tf_list_and_dump_on_empty_database() {
    let tmp = TempDir::new().unwrap();

    broker_cmd(tmp.path())
        .args(["tf", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No deployments."));

    broker_cmd(tmp.path())
        .args(["tf", "dump", "tf:missing:"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not load deployment tf:missing:"));
}

#[test]
fn test_purge_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    broker_cmd(tmp.path())
        .args(["purge", "i1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged service instance i1"));

    broker_cmd(tmp.path())
        .args(["purge-binding", "i1", "b1"])
        .assert()
        .success();
}
