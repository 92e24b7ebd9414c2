use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    io::Read,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info};

use crate::{error::LaunchError, fs_ops};

const EMBEDDED_RESOURCES: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/payload_resources.zip"));

/// A flat table of named byte blobs.
pub trait ResourceSource {
    fn names(&self) -> Result<Vec<String>>;
    fn read(&self, name: &str) -> Result<Vec<u8>>;
}

/// The resource table compiled into the binary by `build.rs`.
pub struct EmbeddedResources {
    archive: &'static [u8],
}

impl EmbeddedResources {
    pub fn bundled() -> Self {
        Self {
            archive: EMBEDDED_RESOURCES,
        }
    }

    fn open(&self) -> Result<zip::ZipArchive<std::io::Cursor<&'static [u8]>>> {
        zip::ZipArchive::new(std::io::Cursor::new(self.archive)).context("read embedded resources")
    }
}

impl ResourceSource for EmbeddedResources {
    fn names(&self) -> Result<Vec<String>> {
        Ok(self.open()?.file_names().map(str::to_string).collect())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let mut zip = self.open()?;
        let mut entry = zip
            .by_name(name)
            .with_context(|| format!("embedded resource {name}"))?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("read embedded resource {name}"))?;
        Ok(buf)
    }
}

impl ResourceSource for BTreeMap<String, Vec<u8>> {
    fn names(&self) -> Result<Vec<String>> {
        Ok(self.keys().cloned().collect())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.get(name)
            .cloned()
            .with_context(|| format!("resource {name} not found"))
    }
}

pub fn resource_prefix(namespace: &str, payload_set: &str) -> String {
    format!("{namespace}.{payload_set}.")
}

/// Maps a flat resource name to the relative path it is deployed to.
///
/// The text after `prefix` is split at its last dot: what follows is the
/// extension and is kept as is, every earlier dot becomes a directory
/// separator. A name with no dot is a bare file name. Directory or file
/// names that themselves contain dots cannot be represented and decode to a
/// different layout.
///
/// Returns `None` when `key` is not under `prefix` or does not decode to a
/// plain relative path.
pub fn decode_resource_name(key: &str, prefix: &str) -> Option<PathBuf> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }
    let (stem, ext) = match rest.rfind('.') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if ext == "." {
        return None;
    }
    let mut segments: Vec<String> = stem.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    if let Some(last) = segments.last_mut() {
        last.push_str(ext);
    }

    let path: PathBuf = segments.iter().collect();
    let plain = path.components().count() == segments.len()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    plain.then_some(path)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub files: usize,
    pub bytes: u64,
}

/// Writes one payload set from a [`ResourceSource`] into an install root.
pub struct PayloadDeployer<'a> {
    source: &'a (dyn ResourceSource + Sync),
    namespace: &'a str,
}

impl<'a> PayloadDeployer<'a> {
    pub fn new(source: &'a (dyn ResourceSource + Sync), namespace: &'a str) -> Self {
        Self { source, namespace }
    }

    /// Overwrites every file of `payload_set` under `target_root`.
    ///
    /// Files outside the payload are never touched. A failure part way leaves
    /// the files already written in place; running again converges.
    pub fn deploy(&self, target_root: &Path, payload_set: &str) -> Result<DeployReport> {
        let prefix = resource_prefix(self.namespace, payload_set);
        let mut names: Vec<String> = self
            .source
            .names()?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        if names.is_empty() {
            return Err(LaunchError::MissingPayload { prefix }.into());
        }
        names.sort();

        let mut report = DeployReport::default();
        for name in &names {
            let rel = decode_resource_name(name, &prefix)
                .ok_or_else(|| LaunchError::InvalidResourceName { name: name.clone() })?;
            let out_path = target_root.join(&rel);
            let bytes = self.source.read(name)?;
            fs_ops::write_bytes_with_retry(&out_path, &bytes, 3)?;
            debug!(resource = %name, path = %out_path.display(), "deployed");
            report.files += 1;
            report.bytes += bytes.len() as u64;
        }
        info!(
            payload = payload_set,
            root = %target_root.display(),
            files = report.files,
            bytes = report.bytes,
            "payload deployed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const PREFIX: &str = "ns.Payload.";

    fn table(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn decode_splits_directories_and_keeps_extension() {
        assert_eq!(
            decode_resource_name("ns.Payload.sub.inner.png", PREFIX),
            Some(PathBuf::from("sub").join("inner.png"))
        );
        assert_eq!(
            decode_resource_name("ns.Payload.a.b.c.json", PREFIX),
            Some(PathBuf::from("a").join("b").join("c.json"))
        );
        assert_eq!(
            decode_resource_name("ns.Payload.config.ini", PREFIX),
            Some(PathBuf::from("config.ini"))
        );
    }

    #[test]
    fn decode_name_without_extension_is_verbatim() {
        assert_eq!(
            decode_resource_name("ns.Payload.LICENSE", PREFIX),
            Some(PathBuf::from("LICENSE"))
        );
    }

    #[test]
    fn decode_dotted_file_name_is_split_into_directories() {
        // Known limitation: `data.v2.json` at the root comes back as `data/v2.json`.
        assert_eq!(
            decode_resource_name("ns.Payload.data.v2.json", PREFIX),
            Some(PathBuf::from("data").join("v2.json"))
        );
    }

    #[test]
    fn decode_rejects_foreign_or_malformed_names() {
        assert_eq!(decode_resource_name("ns.Payload_B.x.txt", PREFIX), None);
        assert_eq!(decode_resource_name("ns.Payload.", PREFIX), None);
        assert_eq!(decode_resource_name("ns.Payload.a..b.txt", PREFIX), None);
        assert_eq!(decode_resource_name("ns.Payload.a..txt", PREFIX), None);
        assert_eq!(decode_resource_name("ns.Payload..txt", PREFIX), None);
        assert_eq!(decode_resource_name("ns.Payload.x.", PREFIX), None);
        assert_eq!(decode_resource_name("ns.Payload./etc/passwd.txt", PREFIX), None);
    }

    #[test]
    fn deploy_writes_only_the_selected_set() {
        let tmp = tempfile::tempdir().unwrap();
        let source = table(&[
            ("ns.Payload.config.ini", "official"),
            ("ns.Payload.Data.Streaming.channel.json", "{\"c\":1}"),
            ("ns.Payload_B.config.ini", "bilibili"),
        ]);
        let deployer = PayloadDeployer::new(&source, "ns");

        let report = deployer.deploy(tmp.path(), "Payload").unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(fs::read_to_string(tmp.path().join("config.ini")).unwrap(), "official");
        assert_eq!(
            fs::read_to_string(tmp.path().join("Data").join("Streaming").join("channel.json")).unwrap(),
            "{\"c\":1}"
        );
    }

    #[test]
    fn deploy_overwrites_and_keeps_unrelated_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("config.ini"), "stale").unwrap();
        fs::write(tmp.path().join("Arknights.exe"), "binary").unwrap();
        let source = table(&[("ns.Payload.config.ini", "fresh")]);

        PayloadDeployer::new(&source, "ns").deploy(tmp.path(), "Payload").unwrap();

        assert_eq!(fs::read_to_string(tmp.path().join("config.ini")).unwrap(), "fresh");
        assert_eq!(fs::read_to_string(tmp.path().join("Arknights.exe")).unwrap(), "binary");
    }

    #[test]
    fn deploy_twice_matches_deploy_once() {
        let source = table(&[
            ("ns.Payload.a.txt", "a"),
            ("ns.Payload.d.e.b.txt", "b"),
        ]);
        let once = tempfile::tempdir().unwrap();
        let twice = tempfile::tempdir().unwrap();
        let deployer = PayloadDeployer::new(&source, "ns");

        deployer.deploy(once.path(), "Payload").unwrap();
        deployer.deploy(twice.path(), "Payload").unwrap();
        deployer.deploy(twice.path(), "Payload").unwrap();

        for rel in [PathBuf::from("a.txt"), PathBuf::from("d").join("e").join("b.txt")] {
            assert_eq!(
                fs::read(once.path().join(&rel)).unwrap(),
                fs::read(twice.path().join(&rel)).unwrap()
            );
        }
        assert_eq!(fs::read_dir(twice.path()).unwrap().count(), 2);
    }

    #[test]
    fn deploy_missing_set_is_a_packaging_error() {
        let tmp = tempfile::tempdir().unwrap();
        let source = table(&[("ns.Payload.a.txt", "a")]);
        let err = PayloadDeployer::new(&source, "ns")
            .deploy(tmp.path(), "Payload_X")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::MissingPayload { prefix }) if prefix == "ns.Payload_X."
        ));
    }

    #[test]
    fn deploy_rejects_unsafe_names() {
        let tmp = tempfile::tempdir().unwrap();
        let source = table(&[("ns.Payload.a..txt", "a")]);
        let err = PayloadDeployer::new(&source, "ns")
            .deploy(tmp.path(), "Payload")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LaunchError>(),
            Some(LaunchError::InvalidResourceName { .. })
        ));
    }

    #[test]
    fn bundled_table_carries_both_server_payloads() {
        let names = EmbeddedResources::bundled().names().unwrap();
        let ns = crate::config::RESOURCE_NAMESPACE;
        for set in ["Payload", "Payload_B"] {
            let prefix = resource_prefix(ns, set);
            assert!(names.iter().any(|n| n.starts_with(&prefix)), "missing {prefix}");
        }
    }
}
