//! Build script for routerfw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `routerfw --version`.

fn main() {
    // Embed git commit, build time, and dirty status
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
