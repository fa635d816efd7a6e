#![cfg(feature = "shm-log-cli")]
use assert_cmd::Command;

fn shm_log(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("shm-log").unwrap();
    cmd.current_dir(dir.path()).arg("--chunk-size=4096");
    cmd
}

#[test]
fn append_arguments_then_status() {
    let dir = tempfile::tempdir().unwrap();

    shm_log(&dir)
        .args(["append", "log.meta", "log.data", "hello", "world!"])
        .assert()
        .success()
        .stdout("0..5\n5..11\n");

    let status = shm_log(&dir)
        .args(["status", "log.meta", "log.data"])
        .assert()
        .success();
    let stdout = String::from_utf8(status.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("cursor: 11\n"));
    assert!(stdout.contains("chunk_size: 4096\n"));
    assert!(stdout.contains("panicked: false\n"));

    let data = std::fs::read(dir.path().join("log.data")).unwrap();
    assert_eq!(&data[..11], b"helloworld!");
}

#[test]
fn append_lines_from_stdin() {
    let dir = tempfile::tempdir().unwrap();

    shm_log(&dir)
        .args(["append", "log.meta", "log.data"])
        .write_stdin("one\ntwo\n")
        .assert()
        .success()
        .stdout("0..3\n3..6\n");
}

#[test]
fn trim_reports_committed_size() {
    let dir = tempfile::tempdir().unwrap();

    shm_log(&dir)
        .args(["append", "log.meta", "log.data", &"x".repeat(5000)])
        .assert()
        .success();

    shm_log(&dir)
        .args(["trim", "log.meta", "log.data"])
        .assert()
        .success()
        .stdout("committed_size: 8192\n");
}

#[test]
fn stress_from_child_processes() {
    let dir = tempfile::tempdir().unwrap();

    let stress = shm_log(&dir)
        .args(["stress", "log.meta", "log.data"])
        .args(["--writers=3", "--count=50", "--size=200"])
        .assert()
        .success();

    let stdout = String::from_utf8(stress.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("cursor: 30000\n"));
    assert!(stdout.contains("verified: 150 records\n"));
}

#[test]
fn rejects_unaligned_chunks() {
    let dir = tempfile::tempdir().unwrap();

    Command::cargo_bin("shm-log")
        .unwrap()
        .current_dir(dir.path())
        .args(["--chunk-size=1000", "status", "log.meta", "log.data"])
        .assert()
        .failure();
}
