//! Build provenance for `gattlink version --extended`.

const FORWARDED: [(&str, &str); 2] = [
    ("TARGET", "GATTLINK_BUILD_TARGET"),
    ("PROFILE", "GATTLINK_BUILD_PROFILE"),
];

fn main() {
    for (source, exported) in FORWARDED {
        if let Ok(value) = std::env::var(source) {
            println!("cargo:rustc-env={exported}={value}");
        }
        println!("cargo:rerun-if-env-changed={source}");
    }
}
