//! Bakes the deployment secrets from `.env` into the firmware image.

const SECRETS: [&str; 4] = [
    "AIRMUX_WIFI_SSID",
    "AIRMUX_WIFI_PASSWORD",
    "AIRMUX_UPLOAD_ENDPOINT",
    "AIRMUX_UPLOAD_API_KEY",
];

fn main() {
    println!("cargo:rerun-if-changed=.env");
    if let Err(e) = dotenvy::dotenv() {
        println!("cargo:warning=no .env loaded ({e}); using the build environment");
    }

    for key in SECRETS {
        println!("cargo:rerun-if-env-changed={key}");
        let value = std::env::var(key).unwrap_or_default();
        if value.is_empty() {
            println!("cargo:warning={key} is not set");
        }
        println!("cargo:rustc-env={key}={value}");
    }

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
