//! CLI integration tests for the demo mode.

use std::io::Write;
use std::process::Command;

fn summary_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(key))
        .unwrap_or_else(|| panic!("{key} line missing"))
}

#[test]
fn demo_cli_reports_degradation_and_no_cell_violation() {
    let bin = env!("CARGO_BIN_EXE_crossway");
    let output = Command::new(bin)
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

    // Two vehicles must never be inside one cell together.
    assert_eq!(summary_value(&stdout, "zone_violation="), "false");
    assert_eq!(summary_value(&stdout, "max_cell_occupancy_observed="), "1");

    // The demo blinds one vehicle's perception on purpose.
    assert_ne!(summary_value(&stdout, "degraded_vehicles="), "[]");
}

#[test]
fn config_file_overrides_defaults() {
    let bin = env!("CARGO_BIN_EXE_crossway");
    let path = std::env::temp_dir().join(format!("crossway-cli-{}.toml", std::process::id()));
    let mut file = std::fs::File::create(&path).expect("create config");
    writeln!(
        file,
        "[simulation]\nseed = 7\nwire_format = \"json\"\n\n[link]\nloss = 0.0\nduplicate = 0.0\ncorrupt = 0.0"
    )
    .expect("write config");
    drop(file);

    let output = Command::new(bin)
        .arg("--config")
        .arg(&path)
        .arg("demo")
        .output()
        .expect("failed to run demo binary");
    let _ = std::fs::remove_file(&path);

    assert!(output.status.success(), "status: {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(summary_value(&stdout, "zone_violation="), "false");
    assert!(
        summary_value(&stdout, "link ").contains("dropped=0"),
        "lossless link still dropped frames"
    );
    assert!(
        summary_value(&stdout, "frames binary ").starts_with("count=0 "),
        "json run put binary frames on the air"
    );
    assert!(!summary_value(&stdout, "frames json ").starts_with("count=0 "));
}

#[test]
fn invalid_config_is_rejected() {
    let bin = env!("CARGO_BIN_EXE_crossway");
    let path = std::env::temp_dir().join(format!("crossway-bad-{}.toml", std::process::id()));
    std::fs::write(&path, "[coordinator]\nsafety_margin_ms = \"soon\"\n").expect("write config");

    let output = Command::new(bin)
        .arg("--config")
        .arg(&path)
        .output()
        .expect("failed to run binary");
    let _ = std::fs::remove_file(&path);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("config error"), "stderr: {stderr}");
}
