use std::process::Command;

fn main() {
    // Short commit hash for the about info; "unknown" outside a checkout.
    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=DRIVER_GIT_SHA={git_sha}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
