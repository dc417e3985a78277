//! Compile time configurations for the util crate
fn main() {
    // the ROLLCALL_PKG_NAME variable is used to create local folders under
    // `~/.config`, `~/.local/state` and other directories. Do not change the name
    // unless you know what you are doing as this means any stored identity and
    // pending attendance records will no longer be found by the agent.
    println!("cargo::rustc-env=ROLLCALL_PKG_NAME=rollcall");
}
