//! Build script for proxywall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `proxywall status`.

fn main() {
    // Packagers may pin the filter binaries at build time
    println!("cargo:rerun-if-env-changed=PROXYWALL_IPTABLES_PATH");
    println!("cargo:rerun-if-env-changed=PROXYWALL_IP6TABLES_PATH");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
