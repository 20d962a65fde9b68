use std::process::Command;

fn runtime(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_clhost_runtime"))
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("failed to spawn clhost_runtime")
}

#[test]
fn prints_sum_of_squares() {
    let out = runtime(&["--n", "1000", "--local", "16"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout.contains("sum of squares of 1..=1000: 333833500"), "stdout: {stdout}");
}

#[test]
fn out_of_order_gpu_queue_gives_the_same_answer() {
    let out = runtime(&["--n", "5000", "--device-type", "gpu", "--out-of-order", "--profiling"]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout.contains("1..=5000: 41679167500"), "stdout: {stdout}");
}

#[test]
fn unit_local_size_is_rejected() {
    let out = runtime(&["--n", "4", "--local", "1"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid argument"));
}

#[test]
fn unknown_device_type_is_a_usage_error() {
    let out = runtime(&["--device-type", "quantum"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown device type"));
}
