fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Packagers can pin the reported revision when there is no git checkout.
    println!("cargo:rerun-if-env-changed=AUTOLAND_GIT_HASH");
    if let Ok(hash) = std::env::var("AUTOLAND_GIT_HASH") {
        println!("cargo:rustc-env=AUTOLAND_GIT_HASH={}", hash);
    }
}
