fn main() {
    // Boot assembly (entry, interrupt stubs, AP trampoline) is assembled
    // outside cargo and linked in via this hook on bare-metal builds.
    println!("cargo:rerun-if-env-changed=ONYX_ASM_OBJECTS");
    if let Ok(objects) = std::env::var("ONYX_ASM_OBJECTS") {
        for obj in objects.split(',') {
            let obj = obj.trim();
            if !obj.is_empty() {
                println!("cargo:rustc-link-arg={}", obj);
                println!("cargo:rerun-if-changed={}", obj);
            }
        }
    }

    // The kernel linker script only applies to the bare-metal target;
    // hosted builds (cargo test) link like any other binary.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "none" {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{}/link.ld", manifest_dir);
        println!("cargo:rerun-if-changed=link.ld");
    }
}
