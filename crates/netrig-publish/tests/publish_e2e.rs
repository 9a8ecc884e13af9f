//! End-to-end publisher tests: plan on disk in, per-host tree out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use netrig_common::config::Config;
use netrig_common::plan::TestPlan;
use netrig_common::value::OverlayValue;
use netrig_publish::error::PublishError;
use netrig_publish::indices::RangeError;
use netrig_publish::overlay::OverlayError;
use netrig_publish::{PublishOptions, Publisher};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()))
}

fn publish(test_dir: &Path, dest: &Path) -> Result<netrig_publish::PublishReport, PublishError> {
    publish_with(test_dir, dest, &PublishOptions::default())
}

fn publish_with(
    test_dir: &Path,
    dest: &Path,
    opts: &PublishOptions,
) -> Result<netrig_publish::PublishReport, PublishError> {
    let plan = TestPlan::from_file(&test_dir.join("test.toml")).unwrap();
    let config = Config::default();
    Publisher::new(&plan, &config).publish(dest, opts)
}

/// The full flow: two indices, one template file, a global overlay.
#[test]
fn template_file_expands_per_index() {
    init_tracing();
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "rf"

[overlays]
FREQ = "900"

[templates]
indices = "1-2"

[[templates.file]]
name = "node.tpl"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("node.tpl"), "frequency=${FREQ}\n");

    let dest = scratch.path().join("out");
    let report = publish(&test_dir, &dest).unwrap();

    assert_eq!(
        report.hostnames.iter().collect::<Vec<_>>(),
        vec!["node-01", "node-02"]
    );
    assert_eq!(read(&dest.join("node-01/node")), "frequency=900\n");
    assert_eq!(read(&dest.join("node-02/node")), "frequency=900\n");

    // The raw template must not survive anywhere in the published tree.
    assert!(!dest.join("node.tpl").exists());
    assert!(!dest.join("node-01/node.tpl").exists());
    assert!(!dest.join("node-02/node.tpl").exists());
}

/// Merge precedence: the test directory beats the base directory.
#[test]
fn test_dir_overrides_base_dir() {
    let scratch = tempfile::tempdir().unwrap();
    let base = scratch.path().join("base.test");
    let test_dir = scratch.path().join("rf.test");
    write(&base.join("foo.txt"), "A");
    write(&base.join("base-only.txt"), "from base");
    write(
        &test_dir.join("test.toml"),
        "name = \"merge\"\nbase = \"../base.test\"\n",
    );
    write(&test_dir.join("foo.txt"), "B");

    let dest = scratch.path().join("out");
    publish(&test_dir, &dest).unwrap();

    assert_eq!(read(&dest.join("foo.txt")), "B");
    assert_eq!(read(&dest.join("base-only.txt")), "from base");
}

#[test]
fn missing_base_dir_is_fatal() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        "name = \"nobase\"\nbase = \"../gone.test\"\n",
    );

    let dest = scratch.path().join("out");
    assert!(matches!(
        publish(&test_dir, &dest),
        Err(PublishError::MissingBaseDirectory(_))
    ));
}

#[test]
fn destination_exists_unless_overwrite() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(&test_dir.join("test.toml"), "name = \"dest\"\n");
    write(&test_dir.join("keep.txt"), "fresh");

    let dest = scratch.path().join("out");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("stale.txt"), "stale").unwrap();

    assert!(matches!(
        publish(&test_dir, &dest),
        Err(PublishError::DestinationExists(_))
    ));

    let opts = PublishOptions {
        overwrite: true,
        ..Default::default()
    };
    publish_with(&test_dir, &dest, &opts).unwrap();
    assert!(!dest.join("stale.txt").exists());
    assert_eq!(read(&dest.join("keep.txt")), "fresh");
}

/// Undefined overlays abort the publish naming file and variable.
#[test]
fn undefined_overlay_is_fatal_and_named() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "strict"

[templates]
indices = "1"

[[templates.file]]
name = "node.tpl"
"#,
    );
    write(&test_dir.join("node.tpl"), "x=${NOT_DECLARED}\n");

    let dest = scratch.path().join("out");
    match publish(&test_dir, &dest) {
        Err(PublishError::UndefinedOverlay { file, name }) => {
            assert!(file.ends_with("node.tpl"), "got {}", file.display());
            assert_eq!(name, "NOT_DECLARED");
        }
        other => panic!("expected UndefinedOverlay, got {other:?}"),
    }
}

#[test]
fn reserved_overlay_declaration_is_fatal() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "collide"

[overlays]
rig_index = "7"
"#,
    );

    let dest = scratch.path().join("out");
    match publish(&test_dir, &dest) {
        Err(PublishError::Overlay(OverlayError::ReservedCollision { keys })) => {
            assert_eq!(keys, vec!["rig_index"]);
        }
        other => panic!("expected ReservedCollision, got {other:?}"),
    }
}

#[test]
fn subset_violation_names_the_artifact() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "subset"

[templates]
indices = "1-4"

[[templates.file]]
name = "node.tpl"
indices = "5-6"
"#,
    );
    write(&test_dir.join("node.tpl"), "n\n");

    let dest = scratch.path().join("out");
    match publish(&test_dir, &dest) {
        Err(PublishError::Range(RangeError::SubsetViolation { artifact, indices })) => {
            assert_eq!(artifact, "node.tpl");
            assert_eq!(indices, vec![5, 6]);
        }
        other => panic!("expected SubsetViolation, got {other:?}"),
    }
}

#[test]
fn missing_template_directory_is_fatal() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "missing"

[templates]
indices = "1"

[[templates.directory]]
name = "cfg.tpl"
"#,
    );

    let dest = scratch.path().join("out");
    assert!(matches!(
        publish(&test_dir, &dest),
        Err(PublishError::MissingTemplateDirectory { .. })
    ));
}

/// A template directory expands its subtree under each derived host.
#[test]
fn template_directory_expands_subtree() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "dirs"

[overlays]
FREQ = "900"

[templates]
indices = "1-2"

[[templates.directory]]
name = "cfg.tpl"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("cfg.tpl/radio.conf"), "f=${FREQ}\n");
    write(&test_dir.join("cfg.tpl/nested/extra.conf"), "i=${rig_index}\n");

    let dest = scratch.path().join("out");
    publish(&test_dir, &dest).unwrap();

    assert_eq!(read(&dest.join("node-01/radio.conf")), "f=900\n");
    assert_eq!(read(&dest.join("node-02/radio.conf")), "f=900\n");
    // rig_index renders unpadded inside file content
    assert_eq!(read(&dest.join("node-01/nested/extra.conf")), "i=1\n");
    assert_eq!(read(&dest.join("node-02/nested/extra.conf")), "i=2\n");
    assert!(!dest.join("cfg.tpl").exists());
}

/// Stale template directories from earlier runs are dropped; declared
/// ones are expanded.
#[test]
fn unreferenced_template_directory_pruned() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "stale"

[templates]
indices = "1"

[[templates.directory]]
name = "cfg.tpl"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("cfg.tpl/a.conf"), "a\n");
    write(&test_dir.join("stale.tpl/old.conf"), "old\n");
    write(&test_dir.join("orphan.tpl"), "orphan file\n");

    let dest = scratch.path().join("out");
    publish(&test_dir, &dest).unwrap();

    assert_eq!(read(&dest.join("node-01/a.conf")), "a\n");
    assert!(!dest.join("stale.tpl").exists());
    assert!(!dest.join("orphan.tpl").exists());
}

/// Files inside a host's own subdirectory see that host's reserved
/// overlays; files outside see none.
#[test]
fn host_subdirectory_gets_reserved_scope() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "hostscope"

[templates]
indices = "1"

[[templates.file]]
name = "node.tpl"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("node.tpl"), "ok\n");
    write(&test_dir.join("node-01/banner.txt"), "host=${rig_hostname}\n");

    let dest = scratch.path().join("out");
    let opts = PublishOptions {
        logdir: Some(PathBuf::from("/var/log/netrig")),
        ..Default::default()
    };
    publish_with(&test_dir, &dest, &opts).unwrap();

    assert_eq!(read(&dest.join("node-01/banner.txt")), "host=node-01\n");
}

#[test]
fn file_outside_host_directory_cannot_see_reserved() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(&test_dir.join("test.toml"), "name = \"noscope\"\n");
    write(&test_dir.join("notes.txt"), "host=${rig_hostname}\n");

    let dest = scratch.path().join("out");
    match publish(&test_dir, &dest) {
        Err(PublishError::UndefinedOverlay { name, .. }) => {
            assert_eq!(name, "rig_hostname");
        }
        other => panic!("expected UndefinedOverlay, got {other:?}"),
    }
}

/// The reserved files are copied through the schema-stripping rewrite,
/// never through substitution.
#[test]
fn reserved_files_rewritten_not_substituted() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "rewrite"
base = "../base.test"

[overlays]
FREQ = "900"

[templates]
indices = "1"

[[templates.file]]
name = "node.tpl"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("node.tpl"), "x\n");
    std::fs::create_dir_all(scratch.path().join("base.test")).unwrap();
    write(
        &test_dir.join("hosts.toml"),
        r#"
hosts = ["node-01"]

[overrides]
node-01 = { logdir = "/var/log" }
"#,
    );

    let dest = scratch.path().join("out");
    publish(&test_dir, &dest).unwrap();

    let published_plan = read(&dest.join("test.toml"));
    assert!(published_plan.contains("name"));
    assert!(published_plan.contains("FREQ"));
    assert!(!published_plan.contains("base"));
    assert!(!published_plan.contains("templates"));

    let published_hosts = read(&dest.join("hosts.toml"));
    assert!(published_hosts.contains("node-01"));
    assert!(!published_hosts.contains("overrides"));
}

#[test]
fn doc_subdirectory_excluded() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(&test_dir.join("test.toml"), "name = \"docs\"\n");
    write(&test_dir.join("doc/README.md"), "internal notes\n");
    write(&test_dir.join("kept.txt"), "kept\n");

    let dest = scratch.path().join("out");
    publish(&test_dir, &dest).unwrap();

    assert!(!dest.join("doc").exists());
    assert_eq!(read(&dest.join("kept.txt")), "kept\n");
}

/// Overlay precedence across the whole stack: runtime beats everything
/// an author can declare; template-local beats test-wide.
#[test]
fn overlay_precedence_end_to_end() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "precedence"

[overlays]
FREQ = "900"
POWER = "1"

[templates]
indices = "1-2"

[[templates.file]]
name = "node.tpl"
hostname_format = "node-${rig_index}"

[templates.file.overlays]
FREQ = "800"

[templates.file.overlay_lists]
CHAN = "11,12"
"#,
    );
    write(
        &test_dir.join("node.tpl"),
        "freq=${FREQ} power=${POWER} chan=${CHAN}\n",
    );

    let dest = scratch.path().join("out");
    let mut runtime = BTreeMap::new();
    runtime.insert("POWER".to_string(), OverlayValue::Int(30));
    let opts = PublishOptions {
        runtime_overlays: runtime,
        ..Default::default()
    };
    publish_with(&test_dir, &dest, &opts).unwrap();

    // template-local FREQ=800 shadows test-wide 900; runtime POWER=30
    // shadows test-wide 1; CHAN comes from the index-keyed local list.
    assert_eq!(
        read(&dest.join("node-01/node")),
        "freq=800 power=30 chan=11\n"
    );
    assert_eq!(
        read(&dest.join("node-02/node")),
        "freq=800 power=30 chan=12\n"
    );
}

/// CSV-backed columns resolve per index value.
#[test]
fn csv_overlays_resolve_per_index() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "csv"
overlay_csv = "overlays.csv"

[templates]
indices = "1-2"

[[templates.file]]
name = "node.tpl"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("overlays.csv"), "index,FREQ\n1,900\n2,901\n");
    write(&test_dir.join("node.tpl"), "f=${FREQ}\n");

    let dest = scratch.path().join("out");
    publish(&test_dir, &dest).unwrap();

    assert_eq!(read(&dest.join("node-01/node")), "f=900\n");
    assert_eq!(read(&dest.join("node-02/node")), "f=901\n");
}

/// A subset template still resolves test-wide lists by index position
/// in the parent block.
#[test]
fn subset_template_resolves_parent_lists() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(
        &test_dir.join("test.toml"),
        r#"
name = "subset-lists"

[overlay_lists]
TXPOWER = "10,12,14,16"

[templates]
indices = "1-4"

[[templates.file]]
name = "node.tpl"
indices = "2,4"
hostname_format = "node-${rig_index}"
"#,
    );
    write(&test_dir.join("node.tpl"), "p=${TXPOWER}\n");

    let dest = scratch.path().join("out");
    let report = publish(&test_dir, &dest).unwrap();

    assert_eq!(report.hostnames.len(), 2);
    assert_eq!(read(&dest.join("node-02/node")), "p=12\n");
    assert_eq!(read(&dest.join("node-04/node")), "p=16\n");
    assert!(!dest.join("node-01").exists());
}

#[test]
fn extra_files_copied_verbatim() {
    let scratch = tempfile::tempdir().unwrap();
    let test_dir = scratch.path().join("rf.test");
    write(&test_dir.join("test.toml"), "name = \"extra\"\n");
    let extra_src = scratch.path().join("run-id.txt");
    write(&extra_src, "run ${not-a-template}\n");

    let dest = scratch.path().join("out");
    let opts = PublishOptions {
        extra_files: vec![netrig_publish::publisher::ExtraFile {
            src: extra_src,
            dest: "meta/run-id.txt".to_string(),
        }],
        ..Default::default()
    };
    publish_with(&test_dir, &dest, &opts).unwrap();

    assert_eq!(read(&dest.join("meta/run-id.txt")), "run ${not-a-template}\n");
}
