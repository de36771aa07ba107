//! End-to-end pack scenarios over real (temporary) environments.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use envpack_core::{NullReporter, PackConfig, PackError, pack};
use envpack_core::inventory::CondaMetaOracle;
use envpack_core::unpack::UnpackManifest;

/// Build a small but realistic environment: one package owning a
/// text-prefix activation script, a binary-prefix shared object, and a
/// plain file; plus the prefix record under `conda-meta/`.
fn make_env(root: &Path) -> PathBuf {
    // Pad the prefix so realistic destination prefixes fit into the
    // embedded placeholder.
    let prefix = root.join(format!("env_{}", "x".repeat(40)));
    let prefix_str = prefix.to_str().unwrap();

    let write = |rel: &str, content: &[u8]| {
        let path = prefix.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    };

    write(
        "bin/activate",
        format!("#!/bin/sh\nexport PATH=\"{prefix_str}/bin:$PATH\"\n").as_bytes(),
    );
    let mut so = b"\x7fELF\x02\x01\x01".to_vec();
    so.extend_from_slice(prefix_str.as_bytes());
    so.extend_from_slice(b"/lib/libfoo.so\0\0\0\0\0\0\0\0");
    so.extend_from_slice(b"\x2e\x2e\x2e");
    write("lib/libfoo.so", &so);
    write("bin/plain", b"no embedded paths here\n");

    let record = serde_json::json!({
        "name": "foo",
        "version": "1.0",
        "build": "h000_0",
        "files": ["bin/activate", "bin/plain", "lib/libfoo.so"],
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
                    "_path": "bin/plain",
                    "path_type": "hardlink"
                },
                {
                    "_path": "lib/libfoo.so",
                    "path_type": "hardlink",
                    "file_mode": "binary",
                    "prefix_placeholder": "/opt/env_build"
                }
            ]
        }
    });
    write(
        "conda-meta/foo-1.0-h000_0.json",
        serde_json::to_string_pretty(&record).unwrap().as_bytes(),
    );
    prefix
}

fn run_pack(config: &PackConfig) -> envpack_core::Result<envpack_core::PackOutcome> {
    let cancel = AtomicBool::new(false);
    pack(config, &CondaMetaOracle, &NullReporter, &cancel)
}

fn read_tar_gz(path: &Path) -> Vec<(String, Vec<u8>)> {
    let gz = flate2::read::GzDecoder::new(fs::File::open(path).unwrap());
    let mut archive = tar::Archive::new(gz);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

fn entry<'a>(entries: &'a [(String, Vec<u8>)], name: &str) -> &'a [u8] {
    &entries
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("no member '{name}'"))
        .1
}

#[test]
fn plain_env_to_tar_gz() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let prefix_str = prefix.to_str().unwrap();
    let out = tmp.path().join("env.tar.gz");

    let config = PackConfig {
        prefix: Some(prefix.clone()),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        n_threads: 2,
        ..PackConfig::default()
    };
    let outcome = run_pack(&config).unwrap();
    assert_eq!(outcome.packages, 1);

    let entries = read_tar_gz(&out);

    // The activation script was rewritten in-stream; the source prefix
    // must not survive in any textual member.
    let activate = entry(&entries, "bin/activate");
    assert_eq!(
        activate,
        b"#!/bin/sh\nexport PATH=\"/srv/app/bin:$PATH\"\n"
    );
    assert!(memchr::memmem::find(activate, prefix_str.as_bytes()).is_none());

    // The shared object ships byte-identical.
    let so = entry(&entries, "lib/libfoo.so");
    assert_eq!(so, fs::read(prefix.join("lib/libfoo.so")).unwrap());

    // The deferred manifest lists exactly the binary rewrite.
    let manifest: UnpackManifest =
        serde_json::from_slice(entry(&entries, "conda-meta/envpack.json")).unwrap();
    assert_eq!(manifest.prefix_placeholder, prefix_str);
    assert_eq!(manifest.destination_prefix, "/srv/app");
    assert_eq!(manifest.files.len(), 1);
    assert_eq!(manifest.files[0].path, "lib/libfoo.so");

    // The runner ships executable at the fixed location.
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"bin/envpack-unpack"));
}

#[test]
fn destination_prefix_too_long_fails_before_output() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("env.tar.gz");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        dest_prefix: Some(format!("/{}", "deep/".repeat(70))),
        ..PackConfig::default()
    };
    let err = run_pack(&config).unwrap_err();
    assert!(matches!(err, PackError::DestinationPrefixTooLong { .. }));
    assert!(!out.exists());
}

#[test]
fn unmanaged_script_is_sniffed_and_rewritten() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let prefix_str = prefix.to_str().unwrap().to_string();
    fs::write(
        prefix.join("bin/my_script"),
        format!("#!/bin/sh\nexec {prefix_str}/lib/python \"$@\"\n"),
    )
    .unwrap();
    let out = tmp.path().join("env.tar.gz");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    let entries = read_tar_gz(&out);
    assert_eq!(
        entry(&entries, "bin/my_script"),
        b"#!/bin/sh\nexec /srv/app/lib/python \"$@\"\n"
    );
}

#[test]
fn missing_managed_file_fatal_then_downgraded() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    fs::remove_file(prefix.join("lib/libfoo.so")).unwrap();
    let out = tmp.path().join("env.tar.gz");

    let config = PackConfig {
        prefix: Some(prefix.clone()),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        ..PackConfig::default()
    };
    let err = run_pack(&config).unwrap_err();
    assert!(matches!(err, PackError::MissingManagedFile { .. }));
    assert!(!out.exists());

    let config = PackConfig {
        ignore_missing_files: true,
        ..config
    };
    run_pack(&config).unwrap();
    let entries = read_tar_gz(&out);
    assert!(entries.iter().all(|(n, _)| n != "lib/libfoo.so"));
    let manifest: UnpackManifest =
        serde_json::from_slice(entry(&entries, "conda-meta/envpack.json")).unwrap();
    assert!(manifest.files.is_empty());
}

#[test]
fn reproducible_output_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());

    let mut outputs = Vec::new();
    for i in 0..2 {
        let out = tmp.path().join(format!("env{i}.tar.gz"));
        let config = PackConfig {
            prefix: Some(prefix.clone()),
            output: Some(out.clone()),
            dest_prefix: Some("/srv/app".to_string()),
            n_threads: 4,
            ..PackConfig::default()
        };
        run_pack(&config).unwrap();
        outputs.push(fs::read(&out).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn member_order_is_depth_first_lexicographic() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    fs::create_dir_all(prefix.join("share/man")).unwrap();
    fs::write(prefix.join("share/man/page.1"), b"man").unwrap();
    fs::write(prefix.join("share/aaa"), b"a").unwrap();
    let out = tmp.path().join("env.tar.gz");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        n_threads: 4,
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    let names: Vec<String> = read_tar_gz(&out)
        .into_iter()
        .map(|(n, _)| n.trim_end_matches('/').to_string())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    // Directories precede their contents.
    let dir_pos = names.iter().position(|n| n == "share").unwrap();
    let child_pos = names.iter().position(|n| n == "share/aaa").unwrap();
    assert!(dir_pos < child_pos);
}

#[test]
fn output_exists_respects_force() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("env.tar.gz");
    fs::write(&out, b"occupied").unwrap();

    let config = PackConfig {
        prefix: Some(prefix.clone()),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        ..PackConfig::default()
    };
    let err = run_pack(&config).unwrap_err();
    assert!(matches!(err, PackError::OutputExists { .. }));

    let config = PackConfig {
        force: true,
        ..config
    };
    run_pack(&config).unwrap();
    assert_ne!(fs::read(&out).unwrap(), b"occupied");
}

#[test]
fn arcroot_prefixes_every_member() {
    let tmp = tempfile::tempdir().unwrap();
    let prefix = make_env(tmp.path());
    let out = tmp.path().join("env.tar.gz");

    let config = PackConfig {
        prefix: Some(prefix),
        output: Some(out.clone()),
        dest_prefix: Some("/srv/app".to_string()),
        arcroot: Some(PathBuf::from("my-env")),
        ..PackConfig::default()
    };
    run_pack(&config).unwrap();

    for (name, _) in read_tar_gz(&out) {
        assert!(name.starts_with("my-env"), "member '{name}' escaped the arcroot");
    }
}
