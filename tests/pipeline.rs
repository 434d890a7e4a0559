//! Pipeline Engine Tests
//!
//! Whole runs over small media trees built in temp directories.

use std::fs;
use std::path::Path;

use mediaflow::core::{PipelineConfig, PipelineEngine, RunLog};
use mediaflow::domain::{
    BridgedEntry, Category, ErrorKind, ErrorStage, EventType, RunState, TransferAction,
};
use tempfile::TempDir;

/// Two images and one video under `root/input`
fn media_tree(root: &Path) -> std::path::PathBuf {
    let input = root.join("input");
    fs::create_dir_all(input.join("trip")).unwrap();
    fs::write(input.join("a.jpg"), b"image a").unwrap();
    fs::write(input.join("trip/b.PNG"), b"image b").unwrap();
    fs::write(input.join("trip/clip.mp4"), vec![7u8; 128]).unwrap();
    input
}

fn engine(root: &Path, yaml: &str) -> PipelineEngine {
    let loaded = PipelineConfig::from_yaml(yaml, root).unwrap();
    assert!(loaded.issues.is_empty(), "unexpected issues: {:?}", loaded.issues);
    PipelineEngine::new(loaded.config).unwrap()
}

fn total(counts: &std::collections::BTreeMap<Category, usize>) -> usize {
    counts.values().sum()
}

const TWO_STEP_PIPELINE: &str = r#"
pipeline_name: two-step
output_root: out
modules:
  listing:
    kind: local
    target: passthrough
pipeline_steps:
  - name: step1
    module: listing
    bridge:
      skip_categories: [image]
      action: copy
  - name: step2
    module: listing
"#;

#[tokio::test]
async fn test_bridged_images_reach_next_step() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    let report = engine(temp.path(), TWO_STEP_PIPELINE)
        .run(&input)
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.error_count(), 0);
    assert_eq!(report.steps.len(), 2);

    let step1 = report.step("step1").unwrap();
    assert_eq!(step1.input_counts[&Category::Image], 2);
    assert_eq!(step1.input_counts[&Category::Video], 1);
    assert_eq!(
        step1.bridged,
        vec![BridgedEntry {
            category: Category::Image,
            count: 2,
            action: TransferAction::Copy,
            skipped: 0,
        }]
    );
    assert_eq!(step1.processed_categories, vec![Category::Video]);
    assert_eq!(step1.processed_count, 1);
    assert_eq!(step1.module_details[&Category::Video]["file_count"], 1);

    // Bridged files land flat in the step output
    let out1 = temp.path().join("out/step1");
    assert!(out1.join("a.jpg").is_file());
    assert!(out1.join("b.PNG").is_file());
    // Copy leaves the sources alone
    assert!(input.join("trip/b.PNG").is_file());

    let step2 = report.step("step2").unwrap();
    assert_eq!(step2.input_dir, out1);
    assert_eq!(total(&step2.input_counts), 3);
    assert_eq!(step2.input_counts, step1.output_counts);
    assert!(step2.bridged.is_empty());
    assert_eq!(
        step2.processed_categories,
        vec![Category::Image, Category::Video]
    );
    assert_eq!(step2.processed_count, 3);

    // Staging keeps layout below the category directory without nesting it again
    let out2 = temp.path().join("out/step2");
    assert!(out1.join("video/trip/clip.mp4").is_file());
    assert!(out2.join("video/trip/clip.mp4").is_file());
    assert!(!out2.join("video/video").exists());
    assert!(out2.join("image/a.jpg").is_file());
}

#[tokio::test]
async fn test_move_bridge_reports_files_left_behind() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("input");
    fs::create_dir_all(input.join("one")).unwrap();
    fs::create_dir_all(input.join("two")).unwrap();
    fs::write(input.join("one/x.jpg"), b"first").unwrap();
    fs::write(input.join("two/x.jpg"), b"second").unwrap();
    fs::write(input.join("y.jpg"), b"new y").unwrap();

    let out1 = temp.path().join("out/s1");
    fs::create_dir_all(&out1).unwrap();
    fs::write(out1.join("y.jpg"), b"old y").unwrap();

    let yaml = r#"
output_root: out
stop_on_error: false
modules:
  listing:
    kind: local
    target: passthrough
pipeline_steps:
  - name: s1
    module: listing
    bridge:
      skip_categories: [image]
      action: move
"#;
    let report = engine(temp.path(), yaml).run(&input).await.unwrap();

    let step = report.step("s1").unwrap();
    assert_eq!(
        step.bridged,
        vec![BridgedEntry {
            category: Category::Image,
            count: 1,
            action: TransferAction::Move,
            skipped: 2,
        }]
    );

    assert_eq!(step.errors.len(), 1);
    let error = &step.errors[0];
    assert_eq!(error.category, Some(Category::Image));
    assert_eq!(error.stage, ErrorStage::Bridge);
    assert_eq!(error.kind, ErrorKind::Transfer);
    assert!(error.message.contains("two/x.jpg"), "{}", error.message);
    assert!(error.message.contains("y.jpg"), "{}", error.message);
    assert!(!error.message.contains("one/x.jpg"), "{}", error.message);

    assert!(!input.join("one/x.jpg").exists());
    assert!(input.join("two/x.jpg").is_file());
    assert!(input.join("y.jpg").is_file());
    assert_eq!(fs::read(out1.join("x.jpg")).unwrap(), b"first");
    assert_eq!(fs::read(out1.join("y.jpg")).unwrap(), b"old y");
    assert_eq!(report.state, RunState::Completed);
}

#[tokio::test]
async fn test_unregistered_module_halts_run() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    let yaml = r#"
output_root: out
stop_on_error: true
modules:
  listing:
    kind: local
    target: passthrough
pipeline_steps:
  - name: broken
    module: ghost
  - name: never
    module: listing
"#;
    let loaded = PipelineConfig::from_yaml(yaml, temp.path()).unwrap();
    assert_eq!(loaded.issues.len(), 1);

    let report = PipelineEngine::new(loaded.config)
        .unwrap()
        .run(&input)
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Halted);
    assert_eq!(report.steps.len(), 1);

    let broken = &report.steps[0];
    assert_eq!(broken.errors.len(), 2);
    for error in &broken.errors {
        assert_eq!(error.kind, ErrorKind::Configuration);
        assert_eq!(error.stage, ErrorStage::Resolve);
        assert!(error.message.contains("ghost"));
    }
    assert!(broken.processed_categories.is_empty());
    assert!(!temp.path().join("out/never").exists());
}

#[tokio::test]
async fn test_errors_are_collected_without_stop_on_error() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    let yaml = r#"
output_root: out
stop_on_error: false
modules:
  listing:
    kind: local
    target: passthrough
pipeline_steps:
  - name: broken
    module: ghost
    bridge:
      skip_categories: [image]
  - name: after
    module: listing
"#;
    let loaded = PipelineConfig::from_yaml(yaml, temp.path()).unwrap();
    let report = PipelineEngine::new(loaded.config)
        .unwrap()
        .run(&input)
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.error_count(), 1);

    // Images still bridged even though the video dispatch failed
    let broken = &report.steps[0];
    assert_eq!(broken.bridged.len(), 1);
    assert_eq!(broken.errors_for(Category::Video).count(), 1);

    let after = &report.steps[1];
    assert!(!after.has_errors());
    assert_eq!(after.input_counts[&Category::Image], 2);
}

#[tokio::test]
async fn test_step_without_output_location_is_skipped() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    let yaml = r#"
modules:
  listing:
    kind: local
    target: passthrough
pipeline_steps:
  - name: nowhere
    module: listing
  - name: somewhere
    module: listing
    output_dir: out/somewhere
"#;
    let report = engine(temp.path(), yaml).run(&input).await.unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].step_name, "somewhere");
    // The skipped step does not change the next step's input
    assert_eq!(report.steps[0].input_dir, input);
}

#[tokio::test]
async fn test_handler_validation_error_is_attributed() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    let yaml = r#"
output_root: out
modules:
  sizes:
    kind: local
    target: size_filter
    config:
      max_bytes: "big"
pipeline_steps:
  - name: filter
    module: sizes
    bridge:
      skip_categories: [image]
"#;
    let report = engine(temp.path(), yaml).run(&input).await.unwrap();

    assert_eq!(report.state, RunState::Halted);
    let filter = &report.steps[0];
    assert_eq!(filter.errors.len(), 1);

    let error = &filter.errors[0];
    assert_eq!(error.category, Some(Category::Video));
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.stage, ErrorStage::Validate);
    assert!(error.message.contains("max_bytes"));
}

#[tokio::test]
async fn test_size_filter_prunes_staged_copy_only() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    let yaml = r#"
output_root: out
modules:
  sizes:
    kind: local
    target: size_filter
    config:
      min_bytes: 64
pipeline_steps:
  - name: filter
    module: sizes
"#;
    let report = engine(temp.path(), yaml).run(&input).await.unwrap();

    let filter = &report.steps[0];
    assert!(!filter.has_errors());
    assert_eq!(filter.module_details[&Category::Image]["removed"], 2);
    assert_eq!(filter.module_details[&Category::Video]["kept"], 1);
    assert_eq!(filter.output_counts.get(&Category::Image), Some(&0));
    assert_eq!(filter.output_counts[&Category::Video], 1);

    // Inputs are never touched by staging
    assert!(input.join("a.jpg").is_file());
}

#[tokio::test]
async fn test_run_log_records_events_and_report() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());
    let logs = temp.path().join("logs");

    let report = engine(temp.path(), TWO_STEP_PIPELINE)
        .with_run_log(&logs)
        .run(&input)
        .await
        .unwrap();

    assert_eq!(RunLog::list_runs(&logs).await.unwrap(), vec![report.run_id]);

    let stored = RunLog::load_report(&logs, report.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, report);

    let log = RunLog::open(&logs, report.run_id).await.unwrap();
    let kinds: Vec<EventType> = log
        .replay()
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventType::RunStarted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::StepStarted,
            EventType::StepCompleted,
            EventType::RunCompleted,
        ]
    );
}

#[tokio::test]
async fn test_report_rebuilt_from_events_when_report_missing() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());
    let logs = temp.path().join("logs");

    let report = engine(temp.path(), TWO_STEP_PIPELINE)
        .with_run_log(&logs)
        .run(&input)
        .await
        .unwrap();

    fs::remove_file(logs.join(report.run_id.to_string()).join("report.json")).unwrap();

    let rebuilt = RunLog::load_report(&logs, report.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rebuilt.state, RunState::Completed);
    assert_eq!(rebuilt.pipeline_name, "two-step");
    assert_eq!(rebuilt.steps, report.steps);
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_module_receives_params_and_config() {
    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());
    fs::create_dir_all(temp.path().join("modules")).unwrap();
    fs::write(
        temp.path().join("modules/echo.sh"),
        "cat \"$1\" > \"$2\"\n",
    )
    .unwrap();

    let yaml = r#"
output_root: out
modules:
  frames:
    kind: external
    target: modules/echo.sh
    interpreter: sh
    config:
      fps: 2
pipeline_steps:
  - name: extract
    module: frames
    input_bindings:
      video_dir: input_dir
      kind: category
    bridge:
      skip_categories: [image, other]
      action: move
"#;
    let loaded = PipelineConfig::from_yaml(yaml, temp.path()).unwrap();
    let work = temp.path().join("work");
    fs::create_dir_all(&work).unwrap();
    let mut config = loaded.config;
    config.scratch_dir = Some(work.clone());

    let report = PipelineEngine::new(config).unwrap().run(&input).await.unwrap();

    let extract = &report.steps[0];
    assert!(!extract.has_errors(), "{:?}", extract.errors);

    let details = &extract.module_details[&Category::Video];
    let staged = temp.path().join("out/extract/video");
    assert_eq!(details["params"]["video_dir"], staged.to_string_lossy().as_ref());
    assert_eq!(details["params"]["kind"], "video");
    assert_eq!(details["config"]["fps"], 2);

    // Move bridging empties the source images
    assert!(!input.join("a.jpg").exists());
    assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_managed_environment_uses_configured_launcher() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let input = media_tree(temp.path());

    fs::create_dir_all(temp.path().join("envs/video/conda-meta")).unwrap();
    fs::create_dir_all(temp.path().join("modules")).unwrap();
    fs::create_dir_all(temp.path().join("tools")).unwrap();

    // Stands in for `conda run --no-capture-output -p <env> <cmd...>`
    let launcher = temp.path().join("tools/conda");
    fs::write(
        &launcher,
        "#!/bin/sh\nprefix=\"$4\"\nshift 4\nLAUNCHER_PREFIX=\"$prefix\" exec \"$@\"\n",
    )
    .unwrap();
    fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(
        temp.path().join("modules/where.sh"),
        "printf '{\"prefix\": \"%s\"}' \"$LAUNCHER_PREFIX\" > \"$2\"\n",
    )
    .unwrap();

    let yaml = r#"
output_root: out
conda_binary: tools/conda
modules:
  frames:
    kind: external
    target: modules/where.sh
    interpreter: sh
    environment: envs/video
pipeline_steps:
  - name: extract
    module: frames
    bridge:
      skip_categories: [image, other]
"#;
    let report = engine(temp.path(), yaml).run(&input).await.unwrap();

    let extract = &report.steps[0];
    assert!(!extract.has_errors(), "{:?}", extract.errors);
    assert_eq!(
        extract.module_details[&Category::Video]["prefix"],
        temp.path().join("envs/video").to_string_lossy().as_ref()
    );
}
