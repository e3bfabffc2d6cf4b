use std::process::Command;

/// Short commit hash of the checkout, or `unknown` outside a git tree.
fn git_revision() -> String {
    Command::new("git")
        .args(["rev-parse", "--short=10", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|rev| rev.trim().to_string())
        .filter(|rev| !rev.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=FANGUARD_GIT_HASH={}", git_revision());

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=FANGUARD_BUILD_PROFILE={profile}");

    for path in ["../../.git/HEAD", "../../.git/refs"] {
        println!("cargo:rerun-if-changed={path}");
    }
}
