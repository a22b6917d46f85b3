//! Integration tests for the `pxe` package commands.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const MANIFEST: &str = r#"{
  "vendor": "acme",
  "title": "widgets",
  "version": "1.0.0",
  "author": "Acme Corp",
  "extensions": [
    { "type": "acme.Widget", "title": { "en": "Widget" } }
  ]
}"#;

/// Writes a `pxe.toml` installing into `<temp>/plugins`.
fn write_config(temp_dir: &TempDir) -> PathBuf {
    let install_dir = temp_dir.path().join("plugins");
    let path = temp_dir.path().join("pxe.toml");
    let content = format!(
        "install_dir = {:?}\nhost_version = \"2.0\"\ninstance_id = \"cli-test\"\n",
        install_dir.to_str().unwrap()
    );
    fs::write(&path, content).unwrap();
    path
}

/// Packs the widgets bundle into `<temp>/out` and returns its path.
fn pack_widgets(temp_dir: &TempDir) -> PathBuf {
    let source = temp_dir.path().join("widgets");
    fs::create_dir_all(source.join("icons")).unwrap();
    fs::write(source.join("bundle.json"), MANIFEST).unwrap();
    fs::write(source.join("icons/widget.svg"), "<svg/>").unwrap();

    let out = temp_dir.path().join("out");
    fs::create_dir_all(&out).unwrap();

    pxe().arg("pack").arg(&source).arg("-o").arg(&out).assert().success().stdout(predicate::str::contains(
        "Packed widgets 1.0.0",
    ));
    out.join("acme-widgets-1.0.0.bundle")
}

fn pxe() -> Command {
    Command::cargo_bin("pxe").unwrap()
}

fn pxe_with(config: &Path) -> Command {
    let mut cmd = pxe();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_help() {
    pxe()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manages extension bundles"))
        .stdout(predicate::str::contains("install"));
}

#[test]
fn test_list_without_packages() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    pxe_with(&config).arg("list").assert().success().stdout(predicate::str::contains("No packages installed"));
}

#[test]
fn test_pack_requires_manifest() {
    let temp_dir = TempDir::new().unwrap();

    pxe().arg("pack").arg(temp_dir.path()).assert().failure();
}

#[test]
fn test_install_file_then_list_json() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);
    let bundle = pack_widgets(&temp_dir);
    assert!(bundle.is_file());

    pxe_with(&config)
        .arg("install")
        .arg(&bundle)
        .assert()
        .success()
        .stdout(predicate::str::contains("Package installed"));
    assert!(temp_dir.path().join("plugins/acme-widgets-1.0.0.bundle").is_file());

    let output = pxe_with(&config).arg("list").arg("--json").output().unwrap();
    assert!(output.status.success());
    let list: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(list[0]["id"], "acme/widgets");
    assert_eq!(list[0]["version"], "1.0.0");
    assert_eq!(list[0]["extensions"][0]["id"], "acme/widgets/acme.Widget");
    assert_eq!(list[0]["extensions"][0]["enabled"], false);
}

#[test]
fn test_installing_same_file_twice_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);
    let bundle = pack_widgets(&temp_dir);

    pxe_with(&config).arg("install").arg(&bundle).assert().success();
    pxe_with(&config).arg("install").arg(&bundle).assert().failure();
}

#[test]
fn test_enable_persists_between_runs() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);
    let bundle = pack_widgets(&temp_dir);
    pxe_with(&config).arg("install").arg(&bundle).assert().success();

    pxe_with(&config)
        .arg("enable")
        .arg("acme/widgets/acme.Widget")
        .assert()
        .success()
        .stdout(predicate::str::contains("Enabled acme/widgets/acme.Widget"));

    let output = pxe_with(&config).arg("list").arg("--json").output().unwrap();
    let list: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(list[0]["extensions"][0]["enabled"], true);
    assert_eq!(list[0]["extensions"][0]["loaded"], true);

    pxe_with(&config).arg("disable").arg("acme/widgets/acme.Widget").assert().success();

    let output = pxe_with(&config).arg("list").arg("--json").output().unwrap();
    let list: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(list[0]["extensions"][0]["enabled"], false);
}

#[test]
fn test_enable_unknown_handler_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    pxe_with(&config).arg("enable").arg("acme/widgets/acme.Missing").assert().failure();
}

#[test]
fn test_remove_deletes_bundle() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);
    let bundle = pack_widgets(&temp_dir);
    pxe_with(&config).arg("install").arg(&bundle).assert().success();

    pxe_with(&config)
        .arg("remove")
        .arg("acme/widgets")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed acme/widgets"));
    assert!(!temp_dir.path().join("plugins/acme-widgets-1.0.0.bundle").exists());

    pxe_with(&config).arg("list").assert().success().stdout(predicate::str::contains("No packages installed"));
}

#[test]
fn test_remove_missing_package_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    pxe_with(&config)
        .arg("remove")
        .arg("acme/nothing")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Package not installed"));
}

#[test]
fn test_updates_without_registries() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    pxe_with(&config).arg("updates").assert().success().stdout(predicate::str::contains("All packages are up to date"));
}

#[test]
fn test_publish_requires_installed_package() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    pxe_with(&config).arg("publish").arg("acme/nothing").assert().failure();
}

#[test]
fn test_invalid_package_id_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(&temp_dir);

    pxe_with(&config).arg("remove").arg("not-an-id").assert().failure();
}
