//! CLI integration tests for the demo mode.

use std::process::Command;

fn summary_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))
        .unwrap_or_else(|| panic!("{key} line missing"))
}

#[test]
fn demo_cli_delivers_every_order_without_overshoot() {
    let bin = env!("CARGO_BIN_EXE_sushi_supply");
    // Keep stderr quiet; the summary is on stdout.
    let output = Command::new(bin)
        .env("SUSHI_LOG", "warn")
        .output()
        .expect("failed to run demo binary");

    assert!(
        output.status.success(),
        "demo exited with non-zero status: {:?}",
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("DEMO SUMMARY"),
        "demo summary missing from output"
    );

    assert_eq!(summary_value(&stdout, "overshoot_violation="), "false");
    assert_eq!(summary_value(&stdout, "orders_pending="), "0");
    assert_eq!(summary_value(&stdout, "orders_cancelled="), "1");
    assert_eq!(summary_value(&stdout, "orders_complete="), "3");
    assert_eq!(summary_value(&stdout, "unresponsive_workers="), "0");
    // Every order was settled before the snapshot, so none come back.
    assert_eq!(summary_value(&stdout, "restored_orders="), "4");
    assert_eq!(summary_value(&stdout, "recovered_orders="), "0");
}

#[test]
fn help_lists_the_sub_commands() {
    let bin = env!("CARGO_BIN_EXE_sushi_supply");
    let output = Command::new(bin)
        .arg("--help")
        .output()
        .expect("failed to run binary");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["bench", "stress", "inspect"] {
        assert!(stdout.contains(command), "usage does not mention {command}");
    }
}

#[test]
fn unknown_command_exits_with_usage() {
    let bin = env!("CARGO_BIN_EXE_sushi_supply");
    let output = Command::new(bin)
        .arg("bake")
        .output()
        .expect("failed to run binary");
    assert_eq!(output.status.code(), Some(2));
}
