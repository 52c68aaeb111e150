//! Build script for fwgate
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `fwgate version`.

fn main() {
    // System state directory can be pinned by packagers
    println!("cargo:rerun-if-env-changed=FWGATE_SYSTEM_STATE_DIR");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
