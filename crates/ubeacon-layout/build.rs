use pyo3_build_config::PythonImplementation;

const VARIANTS: &[&str] = &["py38", "py310", "py311", "py312", "py313"];

fn variant_for(major: u8, minor: u8) -> Option<&'static str> {
    match (major, minor) {
        (3, 8) | (3, 9) => Some("py38"),
        (3, 10) => Some("py310"),
        (3, 11) => Some("py311"),
        (3, 12) => Some("py312"),
        (3, 13) => Some("py313"),
        _ => None,
    }
}

fn main() {
    println!("cargo:rerun-if-env-changed=UBEACON_LAYOUT");
    let expected = VARIANTS
        .iter()
        .map(|v| format!("\"{v}\""))
        .collect::<Vec<_>>()
        .join(", ");
    println!("cargo:rustc-check-cfg=cfg(ubeacon_layout, values({expected}))");

    pyo3_build_config::use_pyo3_cfgs();

    let config = pyo3_build_config::get();
    if config.implementation != PythonImplementation::CPython {
        panic!(
            "ubeacon reads CPython's private object layouts; {:?} is not supported",
            config.implementation
        );
    }

    let variant = match std::env::var("UBEACON_LAYOUT") {
        Ok(forced) => {
            let forced = forced.trim().to_string();
            if !VARIANTS.contains(&forced.as_str()) {
                panic!("UBEACON_LAYOUT={forced} is not one of {expected}");
            }
            forced
        }
        Err(_) => variant_for(config.version.major, config.version.minor)
            .unwrap_or_else(|| {
                panic!(
                    "no layout catalog entry for Python {}.{}; supported range is 3.8 to 3.13",
                    config.version.major, config.version.minor
                )
            })
            .to_string(),
    };

    println!("cargo:rustc-cfg=ubeacon_layout=\"{variant}\"");
}
