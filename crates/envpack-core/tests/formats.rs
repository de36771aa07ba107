//! Per-format end-to-end coverage: zip, tar.zst, parcel, and the
//! no-archive clone with the deferred rewrites applied.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use envpack_core::config::ParcelOptions;
use envpack_core::inventory::CondaMetaOracle;
use envpack_core::unpack::UnpackManifest;
use envpack_core::{ArchiveFormat, NullReporter, PackConfig, apply_unpack, pack};

fn make_env(root: &Path) -> PathBuf {
    let prefix = root.join(format!("env_{}", "p".repeat(48)));
    let prefix_str = prefix.to_str().unwrap();

    let write = |rel: &str, content: &[u8]| {
        let path = prefix.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    };

    write(
        "bin/activate",
        format!("export PREFIX={prefix_str}\n").as_bytes(),
    );
    let mut so = b"\x7fELF".to_vec();
    so.extend_from_slice(prefix_str.as_bytes());
    so.extend_from_slice(b"/lib\0\0\0\0\0\0");
    write("lib/libbar.so", &so);

    let record = serde_json::json!({
        "name": "bar",
        "version": "2.0",
        "build": "0",
        "files": ["bin/activate", "lib/libbar.so"],
        "paths_data": {
            "paths_version": 1,
            "paths": [
                {
                    "_path": "bin/activate",
                    "path_type": "hardlink",
                    "file_mode": "text",
                    "prefix_placeholder": "/opt/env_build"
                },
                {
                    "_path": "lib/libbar.so",
                    "path_type": "hardlink",
                    "file_mode": "binary",
                    "prefix_placeholder": "/opt/env_build"
                }
            ]
        }
    });
    write(
        "conda-meta/bar-2.0-0.json",
        serde_json::to_string_pretty(&record).unwrap().as_bytes(),
    );
    prefix
}

fn run_pack(config: &PackConfig) -> envpack_core::Result<envpack_core::PackOutcome> {
    let cancel = AtomicBool::new(false);
    pack(config, &CondaMetaOracle, &NullReporter, &cancel)
}

#[test]
fn zip_round_trip_with_modes() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("env.zip");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        compress_level: 6,
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    let mut archive = zip::ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
    let mut activate = String::new();
    archive
        .by_name("bin/activate")
        .unwrap()
        .read_to_string(&mut activate)
        .unwrap();
    assert_eq!(activate, "export PREFIX=/srv/app\n");

    let runner = archive.by_name("bin/envpack-unpack").unwrap();
    assert_eq!(runner.unix_mode().unwrap() & 0o777, 0o755);
}

#[test]
fn tar_zst_inferred_from_extension() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("env.tar.zst");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    let zst = zstd::stream::Decoder::new(fs::File::open(&out).unwrap()).unwrap();
    let mut archive = tar::Archive::new(zst);
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&"bin/activate".to_string()));
    assert!(names.contains(&"conda-meta/envpack.json".to_string()));
}

#[test]
fn parcel_layout_and_enforced_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("myenv-3.1-el7.parcel");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        format: Some(ArchiveFormat::Parcel),
        parcel: ParcelOptions {
            name: Some("myenv".to_string()),
            version: Some("3.1".to_string()),
            distribution: Some("el7".to_string()),
            root: None,
        },
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    let gz = flate2::read::GzDecoder::new(fs::File::open(&out).unwrap());
    let mut archive = tar::Archive::new(gz);
    let mut manifest_bytes = Vec::new();
    let mut saw_descriptor = false;
    let mut activate = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        assert!(
            name.starts_with("myenv-3.1"),
            "member '{name}' escaped the parcel root"
        );
        match name.as_str() {
            "myenv-3.1/meta/parcel.json" => saw_descriptor = true,
            "myenv-3.1/conda-meta/envpack.json" => {
                entry.read_to_end(&mut manifest_bytes).unwrap();
            }
            "myenv-3.1/bin/activate" => {
                entry.read_to_end(&mut activate).unwrap();
            }
            _ => {}
        }
    }
    assert!(saw_descriptor);

    // Text rewrites target the enforced parcel destination.
    assert_eq!(
        activate,
        b"export PREFIX=/opt/cloudera/parcels/myenv-3.1\n"
    );
    let manifest: UnpackManifest = serde_json::from_slice(&manifest_bytes).unwrap();
    assert_eq!(
        manifest.destination_prefix,
        "/opt/cloudera/parcels/myenv-3.1"
    );
}

#[test]
fn directory_clone_then_deferred_rewrites() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let prefix_str = prefix.to_str().unwrap().to_string();
    let out = tmp.path().join("clone");

    let config = PackConfig {
        prefix: Some(prefix.clone()),
        output: Some(out.clone()),
        format: Some(ArchiveFormat::NoArchive),
        n_threads: 0,
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    // Default destination: text files carry the neutral placeholder, the
    // binary ships untouched.
    let manifest = UnpackManifest::from_root(&out).unwrap();
    let activate = fs::read_to_string(out.join("bin/activate")).unwrap();
    assert!(activate.contains(&manifest.destination_prefix));
    assert!(!activate.contains(&prefix_str));
    assert_eq!(
        fs::read(out.join("lib/libbar.so")).unwrap(),
        fs::read(prefix.join("lib/libbar.so")).unwrap()
    );

    // Apply the runner's policy in-process: both halves now point at the
    // clone's real location.
    let patched = apply_unpack(&out, None).unwrap();
    assert_eq!(patched, 1);
    let so = fs::read(out.join("lib/libbar.so")).unwrap();
    let out_str = out.to_str().unwrap();
    assert!(memchr::memmem::find(&so, format!("{out_str}/lib").as_bytes()).is_some());
    assert_eq!(
        so.len(),
        fs::read(prefix.join("lib/libbar.so")).unwrap().len()
    );
}

#[test]
fn squashfs_reports_missing_tool() {
    if which::which("mksquashfs").is_ok() {
        // Tool present: nothing to assert about the failure path.
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("env.squashfs");
    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out),
        dest_prefix: Some("/srv/app".to_string()),
        ..PackConfig::default()
    };
    let err = run_pack(&config).unwrap_err();
    assert!(matches!(err, envpack_core::PackError::FormatUnavailable { .. }));
}
