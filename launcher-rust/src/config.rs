// Build-time product metadata generated from the repository's config.toml.
include!(concat!(env!("OUT_DIR"), "/launcher_config.rs"));
