//! Smoke tests for the `trackmesh` binary

use assert_cmd::cargo::cargo_bin;
use assert_cmd::Command;
use predicates::prelude::*;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn trackmesh() -> Command {
    Command::cargo_bin("trackmesh").unwrap()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A `trackmesh start` process, killed on drop
struct RunningNode {
    child: Child,
    api: String,
    _dir: TempDir,
}

impl RunningNode {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let child = std::process::Command::new(cargo_bin("trackmesh"))
            .args(["start", "--host", "127.0.0.1", "--port", &port.to_string()])
            .arg("--data-dir")
            .arg(dir.path())
            .args(["--log-level", "warn"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let api = format!("127.0.0.1:{}", port);
        let deadline = Instant::now() + Duration::from_secs(10);
        while TcpStream::connect(&api).is_err() {
            assert!(Instant::now() < deadline, "node did not start listening");
            std::thread::sleep(Duration::from_millis(50));
        }

        Self {
            child,
            api,
            _dir: dir,
        }
    }
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_help_lists_subcommands() {
    trackmesh()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("start")
                .and(predicate::str::contains("add"))
                .and(predicate::str::contains("get"))
                .and(predicate::str::contains("peers"))
                .and(predicate::str::contains("stats")),
        );
}

#[test]
fn test_start_help_shows_tuning_flags() {
    trackmesh()
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--seed")
                .and(predicate::str::contains("--failure-threshold"))
                .and(predicate::str::contains("--fetch-race-width")),
        );
}

#[test]
fn test_invalid_hash_rejected() {
    let dir = TempDir::new().unwrap();
    trackmesh()
        .args(["get", "not-a-hash", "--output"])
        .arg(dir.path().join("out.bin"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid content hash"));
}

#[test]
fn test_invalid_config_rejected() {
    trackmesh()
        .args(["start", "--fetch-race-width", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fetch_race_width"));
}

#[test]
fn test_unreachable_node_reported() {
    let api = format!("127.0.0.1:{}", free_port());
    trackmesh()
        .args(["list", "--api", &api])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unreachable"));
}

#[test]
fn test_add_list_get_against_running_node() {
    let node = RunningNode::start();
    let work = TempDir::new().unwrap();
    let input = work.path().join("song.bin");
    let output = work.path().join("copy.bin");
    let data = b"some encoded audio frames".repeat(100);
    std::fs::write(&input, &data).unwrap();

    let added = trackmesh()
        .arg("add")
        .arg(&input)
        .args(["--title", "Song", "--artist", "Band", "--api", &node.api])
        .assert()
        .success()
        .stdout(predicate::str::contains("Song"))
        .get_output()
        .stdout
        .clone();
    let hash = String::from_utf8(added)
        .unwrap()
        .lines()
        .next()
        .unwrap()
        .trim()
        .to_string();
    assert_eq!(hash.len(), 64);

    trackmesh()
        .args(["list", "--api", &node.api])
        .assert()
        .success()
        .stdout(predicate::str::contains(hash.as_str()).and(predicate::str::contains("Band")));

    trackmesh()
        .args(["get", &hash, "--api", &node.api, "--output"])
        .arg(&output)
        .assert()
        .success();
    assert_eq!(std::fs::read(&output).unwrap(), data);

    trackmesh()
        .args(["stats", "--api", &node.api])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tracks:        1"));

    trackmesh()
        .args(["peers", "--api", &node.api])
        .assert()
        .success()
        .stdout(predicate::str::contains("No peers"));
}
