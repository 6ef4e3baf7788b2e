use std::fs;
use std::process::{Command, Output};

use tempfile::tempdir;

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sar-simclr"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

#[test]
fn inspect_reports_an_empty_root() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), "not a collection").unwrap();
    let output = run_cli(&["inspect", "--root", dir.path().to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("0 samples in 0 collections"), "{stdout}");
    assert!(stdout.contains("sample shape: [12, 64, 64]"), "{stdout}");
}

#[test]
fn inspect_summarises_an_embeddings_file() {
    let dir = tempdir().unwrap();
    let csv = dir.path().join("emb.csv");
    fs::write(&csv, "0,1,2\n0.5,1,-2\n3,4,5\n").unwrap();
    let output = run_cli(&[
        "inspect",
        "--root",
        dir.path().to_str().unwrap(),
        "--embeddings",
        csv.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("2 rows x 3 columns"), "{stdout}");
}

#[test]
fn config_file_overrides_are_validated() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("pipeline.toml");
    fs::write(&config, "[train]\ntemperature = -1.0\n").unwrap();
    let output = run_cli(&[
        "inspect",
        "--config",
        config.to_str().unwrap(),
        "--root",
        dir.path().to_str().unwrap(),
    ]);
    assert!(!output.status.success());
}

#[test]
fn training_without_collections_fails() {
    let dir = tempdir().unwrap();
    let output = run_cli(&[
        "train",
        "--root",
        dir.path().to_str().unwrap(),
        "--checkpoint",
        dir.path().join("enc.bin").to_str().unwrap(),
        "--epochs",
        "1",
    ]);
    assert!(!output.status.success());
    assert!(!dir.path().join("enc.bin").exists());
}
