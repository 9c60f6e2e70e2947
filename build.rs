fn main() {
    // Load .env file for WiFi and endpoint configuration
    load_env_config();

    // Host builds only compile the library and its unit tests
    if !firmware_target() {
        return;
    }

    linker_be_nice();
    // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
    println!("cargo:rustc-link-arg=-Tlinkall.x");
}

fn firmware_target() -> bool {
    std::env::var("CARGO_CFG_TARGET_OS")
        .map(|os| os == "none")
        .unwrap_or(false)
}

/// Build-time settings exported to the crate as `env!` constants.
/// The second element is the fallback used when neither the environment
/// nor `.env` provides a value.
const SETTINGS: &[(&str, &str)] = &[
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("WS_HOST", ""),
    ("WS_PORT", "8380"),
    ("WS_PATH", "/env"),
    ("NTP_SERVER", "162.159.200.1"),
    ("CAMERA_PORT", "8380"),
];

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    for (key, _) in SETTINGS {
        println!("cargo:rerun-if-env-changed={}", key);
    }

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    for (key, fallback) in SETTINGS {
        // Empty strings count as unset
        let value = env::var(key)
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string());

        if *key == "WS_PORT" || *key == "CAMERA_PORT" {
            if value.parse::<u16>().is_err() {
                panic!("{} must be a port number, got '{}'", key, value);
            }
        }

        println!("cargo:rustc-env={}={}", key, value);

        if value.is_empty() {
            println!("cargo:warning={} is empty - it will not be configured", key);
        } else if *key == "WIFI_PASSWORD" {
            println!("cargo:warning=WIFI_PASSWORD configured (length: {})", value.len());
        } else {
            println!("cargo:warning={} configured: {}", key, value);
        }
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_defmt_timestamp" => {
                    eprintln!();
                    eprintln!("💡 `defmt` not found - make sure `defmt.x` is added as a linker script and you have included `use defmt_rtt as _;`");
                    eprintln!();
                }
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "esp_wifi_preempt_enable"
                | "esp_wifi_preempt_yield_task"
                | "esp_wifi_preempt_task_create" => {
                    eprintln!();
                    eprintln!("💡 `esp-wifi` has no scheduler enabled. Make sure you have the `builtin-scheduler` feature enabled, or that you provide an external scheduler.");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
