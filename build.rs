fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" and never scans unless the binary
    // carries an Info.plist with NSBluetoothAlwaysUsageDescription. A CLI tool
    // has no bundle, so the plist goes into the __TEXT,__info_plist section of
    // the Mach-O image via the linker's -sectcreate flag.
    //
    // CARGO_CFG_TARGET_OS is the target, not the host, so cross builds to
    // macOS get the section too. Builds without the `btle` feature never touch
    // Bluetooth and skip it.
    let target_is_macos = std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos");
    let btle_enabled = std::env::var_os("CARGO_FEATURE_BTLE").is_some();

    if target_is_macos && btle_enabled {
        let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            println!("cargo:warning=CARGO_MANIFEST_DIR unset; Info.plist not embedded");
            return;
        };
        let plist = format!("{dir}/Info.plist");

        println!("cargo:rustc-link-arg-bins=-sectcreate");
        println!("cargo:rustc-link-arg-bins=__TEXT");
        println!("cargo:rustc-link-arg-bins=__info_plist");
        println!("cargo:rustc-link-arg-bins={plist}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
    println!("cargo:rerun-if-changed=build.rs");
}
