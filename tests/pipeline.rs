//! End-to-end scenarios: both clusters served by in-memory fixtures, all
//! three stages run through the coordinator.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use vbdiff::cluster::fixture::FixtureBuilder;
use vbdiff::config::DiffConfig;
use vbdiff::core::{BinnedRecord, CheckpointDoc};
use vbdiff::differ::{MUTATION_DIFF_FILE_NAME, MutationDiffReport, load_diff_keys};
use vbdiff::tool::DiffTool;

fn test_config(root: &TempDir) -> DiffConfig {
    let mut config = DiffConfig::default();
    config.source.url = "fixture://in-memory".to_string();
    config.target.url = "fixture://in-memory".to_string();
    config.source_file_dir = root.path().join("source");
    config.target_file_dir = root.path().join("target");
    config.checkpoint_file_dir = root.path().join("checkpoint");
    config.file_differ_dir = root.path().join("fileDiff");
    config.mutation_differ_dir = root.path().join("mutationDiff");
    config.num_source_dcp_clients = 2;
    config.workers_per_source_dcp_client = 4;
    config.num_target_dcp_clients = 2;
    config.workers_per_target_dcp_client = 4;
    config.file_differ_workers = 4;
    config.mutation_differ_workers = 2;
    config.num_bins = 2;
    config.num_file_desc = 64;
    config.source_dcp_handler_chan_size = 256;
    config.target_dcp_handler_chan_size = 256;
    config.delay_between_source_and_target = Duration::from_millis(10);
    config.checkpoint_interval = None;
    config.new_checkpoint_file_name = Some("ckpt".to_string());
    config.mutation_differ_timeout = Duration::from_secs(5);
    config
}

fn run_tool(
    config: DiffConfig,
    source: vbdiff::cluster::fixture::FixtureCluster,
    target: vbdiff::cluster::fixture::FixtureCluster,
) {
    let tool =
        DiffTool::with_connectors(config, source.into_connector(), target.into_connector())
            .unwrap();
    tool.run().unwrap();
}

fn read_report(config: &DiffConfig) -> MutationDiffReport {
    let bytes = fs::read(config.mutation_differ_dir.join(MUTATION_DIFF_FILE_NAME)).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn count_binned_records(dir: &Path) -> usize {
    let mut count = 0;
    for entry in fs::read_dir(dir).unwrap() {
        let data = fs::read(entry.unwrap().path()).unwrap();
        let mut offset = 0;
        while offset < data.len() {
            let (_, next) = BinnedRecord::decode(&data, offset).unwrap();
            offset = next;
            count += 1;
        }
    }
    count
}

#[test]
fn perfect_replica_produces_an_empty_report() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);

    let mut source = FixtureBuilder::new("source");
    let mut target = FixtureBuilder::new("target");
    for builder in [&mut source, &mut target] {
        for i in 0..100 {
            builder.put(format!("user::{i}").as_bytes(), format!("value-{i}").as_bytes());
        }
    }

    run_tool(config.clone(), source.finish(), target.finish());

    assert!(count_binned_records(&config.source_file_dir) == 100);
    assert!(count_binned_records(&config.target_file_dir) == 100);
    assert!(load_diff_keys(&config.file_differ_dir).unwrap().is_empty());
    assert!(read_report(&config).is_empty());
}

#[test]
fn key_missing_on_target_is_classified() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);

    let mut source = FixtureBuilder::new("source");
    let mut target = FixtureBuilder::new("target");
    for i in 1..=10 {
        source.put(format!("k{i}").as_bytes(), b"v");
    }
    for i in 1..=9 {
        target.put(format!("k{i}").as_bytes(), b"v");
    }

    run_tool(config.clone(), source.finish(), target.finish());

    assert_eq!(
        load_diff_keys(&config.file_differ_dir).unwrap(),
        vec!["k10".to_string()]
    );
    let report = read_report(&config);
    assert_eq!(
        report.missing_from_target.keys().collect::<Vec<_>>(),
        vec!["k10"]
    );
    assert!(report.missing_from_source.is_empty());
    assert!(report.mismatch.is_empty());
}

#[test]
fn value_mismatch_with_identical_cas_is_reported() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);

    let mut source = FixtureBuilder::new("source");
    let mut target = FixtureBuilder::new("target");
    source.put(b"stable", b"same");
    target.put(b"stable", b"same");
    source.put_with_cas(b"conflicted", b"source-version", 0x42);
    target.put_with_cas(b"conflicted", b"target-version", 0x42);

    run_tool(config.clone(), source.finish(), target.finish());

    assert_eq!(
        load_diff_keys(&config.file_differ_dir).unwrap(),
        vec!["conflicted".to_string()]
    );
    let report = read_report(&config);
    assert_eq!(report.mismatch.keys().collect::<Vec<_>>(), vec!["conflicted"]);
    let (source_meta, target_meta) = &report.mismatch["conflicted"];
    assert_eq!(source_meta.value, b"source-version");
    assert_eq!(target_meta.value, b"target-version");
}

#[test]
fn deletions_replicate_cleanly() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);

    let mut source = FixtureBuilder::new("source");
    let mut target = FixtureBuilder::new("target");
    for builder in [&mut source, &mut target] {
        builder.put(b"kept", b"v").put(b"removed", b"v").delete(b"removed");
    }

    run_tool(config.clone(), source.finish(), target.finish());

    assert!(load_diff_keys(&config.file_differ_dir).unwrap().is_empty());
    assert!(read_report(&config).is_empty());
}

#[test]
fn filtered_keys_are_excluded_from_the_diff() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.filter_expression = Some("^app:".to_string());

    let mut source = FixtureBuilder::new("source");
    let mut target = FixtureBuilder::new("target");
    // system keys disagree wildly but are outside the replicated set
    source.put(b"_sys:config", b"source-internal");
    target.put(b"_sys:config", b"target-internal");
    source.put(b"app:present", b"v");
    source.put(b"app:missing", b"v");
    target.put(b"app:present", b"v");

    run_tool(config.clone(), source.finish(), target.finish());

    assert_eq!(
        load_diff_keys(&config.file_differ_dir).unwrap(),
        vec!["app:missing".to_string()]
    );
}

#[test]
fn second_run_resumes_from_the_saved_checkpoint() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.run_file_differ = false;
    config.run_mutation_differ = false;

    let seed = |extra: bool| {
        let mut source = FixtureBuilder::new("source");
        let mut target = FixtureBuilder::new("target");
        for builder in [&mut source, &mut target] {
            builder.put(b"a", b"1").put(b"b", b"2").put(b"c", b"3");
        }
        if extra {
            source.put(b"d", b"4");
        }
        (source.finish(), target.finish())
    };

    let (source, target) = seed(false);
    run_tool(config.clone(), source, target);

    let source_ckpt_path = config.checkpoint_file_dir.join("source_ckpt");
    let first_doc = CheckpointDoc::load(&source_ckpt_path).unwrap();
    let records_after_first = count_binned_records(&config.source_file_dir);
    assert_eq!(records_after_first, 3);

    // resume against a source that has one more mutation: only the new
    // mutation may be streamed and binned
    config.old_source_checkpoint_file_name = Some("ckpt".to_string());
    config.old_target_checkpoint_file_name = Some("ckpt".to_string());
    let (source, target) = seed(true);
    run_tool(config.clone(), source, target);

    assert_eq!(count_binned_records(&config.source_file_dir), 4);
    assert_eq!(count_binned_records(&config.target_file_dir), 3);

    let second_doc = CheckpointDoc::load(&source_ckpt_path).unwrap();
    for (vbno, first) in &first_doc.checkpoints {
        let second = &second_doc.checkpoints[vbno];
        assert!(second.seqno >= first.seqno);
        assert!(second.snapshot_start_seqno <= second.seqno);
        assert!(second.seqno <= second.snapshot_end_seqno);
    }
}

#[test]
fn disabled_stages_are_skipped() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config.run_data_generation = false;
    config.run_mutation_differ = false;
    // stage 2 over empty input directories: an empty diff-key list
    fs::create_dir_all(&config.source_file_dir).unwrap();
    fs::create_dir_all(&config.target_file_dir).unwrap();

    let source = FixtureBuilder::new("source").finish();
    let target = FixtureBuilder::new("target").finish();
    run_tool(config.clone(), source, target);

    assert!(load_diff_keys(&config.file_differ_dir).unwrap().is_empty());
    assert!(!config.mutation_differ_dir.join(MUTATION_DIFF_FILE_NAME).exists());
}
