#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

pub fn commbench_bin() -> &'static str {
    env!("CARGO_BIN_EXE_commbench")
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Answer every HTTP request on a fresh port with `200 OK`, standing in for
/// the inference server's health endpoint. Lives until the test exits.
pub fn health_responder() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind health port");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
            );
        }
    });
    port
}

/// Fake server: writes canned NCCL lines when asked to, records its pid
/// under `pid_dir`, then idles until it is terminated.
pub fn server_command(pid_dir: &Path) -> Vec<String> {
    let script = format!(
        "[ -n \"$NCCL_DEBUG_FILE\" ] && printf 'AllReduce busbw 40.0 size 1048576\\nAllReduce busbw 60.0 size 1048576\\nBroadcast size 4096\\n' > \"$NCCL_DEBUG_FILE\"; \
         echo $$ > '{}/{{label}}.pid'; exec sleep 60",
        pid_dir.display()
    );
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script,
        "sh".to_string(),
        "{port}".to_string(),
    ]
}

/// Fake client: reports `gpus * 100` ms, or exits 4 when its label is
/// `fail_label`. Every invocation is appended to `<output>/invocations.txt`.
pub fn client_command(output_dir: &Path, fail_label: Option<&str>) -> Vec<String> {
    let fail = fail_label.unwrap_or("NONE");
    let script = format!(
        "echo \"$0\" >> '{}/invocations.txt'; [ \"$0\" = {fail} ] && {{ echo 'client crashed' >&2; exit 4; }}; \
         printf '{{\"metrics\":{{\"e2e_latency_ms\":%s00,\"ttft_ms\":5.0}},\"raw_data\":{{\"e2e_times\":[%s00,%s00]}}}}' \"$1\" \"$1\" \"$1\" > \"$BENCH_RESULT_PATH\"",
        output_dir.display()
    );
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script,
        "{label}".to_string(),
        "{gpus}".to_string(),
    ]
}

pub struct MatrixSetup {
    pub config: PathBuf,
    pub output_dir: PathBuf,
    pub pid_dir: PathBuf,
}

pub fn write_matrix(
    dir: &Path,
    port: u16,
    strategies: &[(u32, u32)],
    fail_label: Option<&str>,
) -> MatrixSetup {
    let output_dir = dir.join("bench_out");
    let pid_dir = dir.join("pids");
    std::fs::create_dir_all(&output_dir).unwrap();
    std::fs::create_dir_all(&pid_dir).unwrap();

    let config = json!({
        "output_dir": "bench_out",
        "sequence_length": 128,
        "server_command": server_command(&pid_dir),
        "client_command": client_command(&output_dir, fail_label),
        "port": port,
        "health_timeout_secs": 5.0,
        "poll_interval_secs": 0.1,
        "shutdown_grace_secs": 1.0,
        "monitor": { "enabled": false },
        "strategies": strategies
            .iter()
            .map(|(tp, pp)| json!({ "tp": tp, "pp": pp }))
            .collect::<Vec<_>>(),
    });
    let path = dir.join("matrix.json");
    write_json(&path, &config);
    MatrixSetup {
        config: path,
        output_dir,
        pid_dir,
    }
}

pub fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).expect("write json");
}

pub fn read_json(path: &Path) -> Value {
    let bytes = std::fs::read(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    serde_json::from_slice(&bytes).expect("parse json")
}

pub fn run_commbench(args: &[&str]) -> Output {
    Command::new(commbench_bin())
        .args(["--log-level", "warn"])
        .args(args)
        .env_remove("COMMBENCH_CONFIG")
        .output()
        .expect("run commbench")
}

pub fn assert_ok(output: &Output, context: &str) {
    assert!(
        output.status.success(),
        "{context} failed (status {:?})\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn stdout_str(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr_str(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

pub fn read_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("read pid file {}: {e}", path.display()))
        .trim()
        .parse()
        .expect("pid")
}

#[cfg(unix)]
pub fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn wait_for_file(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() > deadline {
            panic!("{} did not appear within {timeout:?}", path.display());
        }
        thread::sleep(Duration::from_millis(20));
    }
}
