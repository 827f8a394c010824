//! Integration tests for top-level CLI behavior.

use std::path::Path;
use std::process::Command;

fn run_vcrproxy(dir: &Path, args: &[&str]) -> std::process::Output {
    let bin = env!("CARGO_BIN_EXE_vcrproxy");
    Command::new(bin)
        .args(args)
        .current_dir(dir)
        .env_remove("VCRPROXY_CONFIG")
        .env_remove("VCRPROXY_LISTEN")
        .output()
        .expect("failed to run vcrproxy binary")
}

#[test]
fn config_show_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_vcrproxy(dir.path(), &["config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("listen: 127.0.0.1:5000"));
    assert!(stdout.contains("upstream_timeout_secs: 100"));
}

#[test]
fn config_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("proxy.yaml"), "listen: 127.0.0.1:7001\njournal: true\n")
        .unwrap();
    let output = run_vcrproxy(dir.path(), &["--config", "proxy.yaml", "config", "show"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("listen: 127.0.0.1:7001"));
    assert!(stdout.contains("journal: true"));
}

#[test]
fn config_locate_walks_up_to_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    std::fs::create_dir_all(dir.path().join("sdk/tables/tests")).unwrap();
    std::fs::write(
        dir.path().join("sdk/tables/assets.json"),
        concat!(
            r#"{"AssetsRepo":"Azure/azure-sdk-assets","AssetsRepoPrefixPath":"python/tables","#,
            r#""Tag":"python/tables_abc"}"#,
        ),
    )
    .unwrap();

    let output =
        run_vcrproxy(dir.path(), &["config", "locate", "--assets-json", "sdk/tables/tests"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("assets.json"));
    assert!(stdout.contains("tag: python/tables_abc"));
}

#[test]
fn restore_without_manifest_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    let output = run_vcrproxy(dir.path(), &["restore"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("assets.json"));
}

#[test]
fn help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_vcrproxy(dir.path(), &["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    for command in ["serve", "restore", "push", "reset", "maintenance"] {
        assert!(stdout.contains(command), "missing {command}");
    }
}

#[test]
fn unknown_subcommand_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_vcrproxy(dir.path(), &["frobnicate"]);
    assert!(!output.status.success());
}
