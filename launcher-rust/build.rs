use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use serde::Deserialize;

fn main() {
    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR not set");
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let manifest_dir = PathBuf::from(manifest_dir);
    let repo_root = manifest_dir.join("..");
    let payloads_dir = repo_root.join("payloads");
    println!("cargo:rerun-if-changed={}", payloads_dir.display());
    let out_path = PathBuf::from(&out_dir).join("payload_resources.zip");
    let config = load_config(&repo_root).unwrap_or_else(|err| {
        panic!("failed to load config.toml: {err}");
    });

    if !payloads_dir.exists() {
        panic!("payloads/ directory not found; cannot embed payload sets");
    }

    if let Err(err) = write_resource_zip(&payloads_dir, &config.resource_namespace, &out_path) {
        panic!("failed to build payload resources: {err}");
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "windows" {
        if let Err(err) = embed_icon(&repo_root, &config) {
            panic!("failed to embed icon: {err}");
        }
    }

    if let Err(err) = write_config_rs(&PathBuf::from(&out_dir), &config) {
        panic!("failed to write config: {err}");
    }
}

/// Packs every `payloads/<set>/...` file as a flat entry named
/// `<namespace>.<set>.<seg>...<ext>`.
fn write_resource_zip(payloads_dir: &Path, namespace: &str, out_path: &Path) -> io::Result<()> {
    let file = File::create(out_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();

    let mut sets: Vec<PathBuf> = fs::read_dir(payloads_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    sets.sort();

    for set_dir in sets {
        let set_name = set_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut files = Vec::new();
        collect_files(&set_dir, &mut files)?;
        files.sort();
        for path in files {
            let rel = path.strip_prefix(&set_dir).unwrap_or(&path);
            warn_if_lossy(&set_name, rel);
            let segments: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let name = format!("{namespace}.{set_name}.{}", segments.join("."));
            zip.start_file(name, options)?;
            let mut f = File::open(&path)?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            zip.write_all(&buf)?;
        }
    }

    zip.finish()?;
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

// Names that the last-dot decoding rule cannot reproduce.
fn warn_if_lossy(set_name: &str, rel: &Path) {
    let segments: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    let Some((file_name, dirs)) = segments.split_last() else {
        return;
    };
    for dir in dirs {
        if dir.contains('.') {
            println!(
                "cargo:warning=payload {set_name}: directory `{dir}` contains a dot and will not round-trip ({})",
                rel.display()
            );
        }
    }
    match file_name.matches('.').count() {
        0 if !dirs.is_empty() => println!(
            "cargo:warning=payload {set_name}: `{}` has no extension and will not round-trip",
            rel.display()
        ),
        n if n > 1 => println!(
            "cargo:warning=payload {set_name}: `{}` has a dotted stem and will not round-trip",
            rel.display()
        ),
        _ => {}
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    app_id: String,
    name: String,
    product_name: String,
    company: String,
    description: String,
    version: String,
    #[serde(default)]
    icon: String,
    resource_namespace: String,
    game_exe: String,
    tool_exe: String,
}

fn load_config(repo_root: &Path) -> io::Result<Config> {
    let config_path = repo_root.join("config.toml");
    println!("cargo:rerun-if-changed={}", config_path.display());
    let contents = fs::read_to_string(&config_path)?;
    let cfg: Config = toml::from_str(&contents)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(cfg)
}

fn embed_icon(repo_root: &Path, config: &Config) -> io::Result<()> {
    let icon_path = resolve_icon_path(repo_root, config);
    let mut res = winres::WindowsResource::new();
    if let Some(icon_path) = icon_path {
        res.set_icon(icon_path.to_string_lossy().as_ref());
    }
    if !config.product_name.is_empty() {
        res.set("ProductName", &config.product_name);
    }
    if !config.description.is_empty() {
        res.set("FileDescription", &config.description);
    }
    if !config.company.is_empty() {
        res.set("CompanyName", &config.company);
    }
    if !config.version.is_empty() {
        res.set("FileVersion", &config.version);
        res.set("ProductVersion", &config.version);
    }
    if !config.app_id.is_empty() {
        res.set("InternalName", &config.app_id);
    }
    res.compile()?;
    Ok(())
}

fn resolve_icon_path(repo_root: &Path, config: &Config) -> Option<PathBuf> {
    if !config.icon.is_empty() {
        let candidate = repo_root.join(&config.icon);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    let assets_dir = repo_root.join("assets");
    if !assets_dir.exists() {
        return None;
    }
    let mut ico_paths: Vec<PathBuf> = fs::read_dir(&assets_dir).ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|e| e.eq_ignore_ascii_case("ico")).unwrap_or(false))
        .collect();
    ico_paths.sort();
    ico_paths.first().cloned()
}

fn write_config_rs(out_dir: &Path, config: &Config) -> io::Result<()> {
    let out_path = out_dir.join("launcher_config.rs");
    let mut file = File::create(&out_path)?;
    writeln!(file, "pub const APP_ID: &str = {:?};", config.app_id)?;
    writeln!(file, "pub const NAME: &str = {:?};", config.name)?;
    writeln!(file, "pub const PRODUCT_NAME: &str = {:?};", config.product_name)?;
    writeln!(file, "pub const VERSION: &str = {:?};", config.version)?;
    writeln!(
        file,
        "pub const RESOURCE_NAMESPACE: &str = {:?};",
        config.resource_namespace
    )?;
    writeln!(file, "pub const GAME_EXE: &str = {:?};", config.game_exe)?;
    writeln!(file, "pub const TOOL_EXE: &str = {:?};", config.tool_exe)?;
    Ok(())
}
