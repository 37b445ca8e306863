//! Integration test: recorded dispatch stream through the agent
//!
//! Loads configuration and a recording from disk, replays it against the
//! simulated runtime, and checks results.txt and the per-unit trace files.

use anyhow::Result;
use kdprof_agent::{replay, Agent, AgentConfig, Recording};
use kdprof_gpu::SimulatedRuntime;
use kdprof_shared::CompletionMode;
use std::path::Path;
use std::sync::Arc;

const RECORDING: &str = r#"{
  "hardware": {
    "metrics": { "SQ_WAVES": 128, "SQ_INSTS": 4096 },
    "trace_units": [[1, 0, 2, 0, 3, 0, 4, 0, 5, 0], [239, 190, 173, 222, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]]
  },
  "dispatches": [
    { "kernel_name": "gemm_a", "device_index": 0, "queue_index": 0 },
    { "kernel_name": "reduce", "device_index": 0, "queue_index": 0 },
    { "kernel_name": "gemm_b", "device_index": 0, "queue_index": 0 }
  ]
}"#;

fn write(dir: &Path, name: &str, contents: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents)?;
    Ok(path)
}

fn headers(results: &str) -> Vec<String> {
    results
        .lines()
        .filter(|line| line.starts_with("dispatch["))
        .map(|line| line.split(", time(").next().unwrap_or(line).to_string())
        .collect()
}

async fn run(config: &AgentConfig, recording: &Recording) -> Result<(String, kdprof_agent::AgentSummary)> {
    let runtime = Arc::new(SimulatedRuntime::new(recording.hardware.clone().into()));
    let mut agent = Agent::start(config, runtime.clone())?;
    replay(&mut agent, recording).await?;
    let summary = agent.stop();
    assert_eq!(runtime.sessions_open(), 0);

    let results_path = config.results_path().expect("output dir configured");
    Ok((std::fs::read_to_string(results_path)?, summary))
}

#[tokio::test]
async fn test_kernel_filter_with_traces() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");
    std::fs::create_dir(&out)?;

    let config_path = write(
        dir.path(),
        "kdprof.toml",
        &format!(
            r#"
output_dir = "{}"
metrics = ["SQ_WAVES", "SQ_INSTS"]

[[traces]]
name = "SQTT"
parameters = {{ MASK = "0x0f00", TOKEN_MASK = "0x344b" }}

[filter]
kernel = ["gemm"]
"#,
            out.display()
        ),
    )?;
    let recording_path = write(dir.path(), "recording.json", RECORDING)?;

    let config = AgentConfig::load(Some(&config_path))?;
    config.validate()?;
    assert_eq!(config.completion_mode(), CompletionMode::Push);
    let recording = Recording::load(&recording_path)?;

    let (results, summary) = run(&config, &recording).await?;

    assert_eq!(summary.observed, 3);
    assert_eq!(summary.collected, 2);
    assert_eq!(
        headers(&results),
        vec![
            "dispatch[0], queue_index(0), kernel_name(\"gemm_a\")",
            "dispatch[2], queue_index(0), kernel_name(\"gemm_b\")",
        ]
    );
    assert!(results.contains("  SQ_WAVES (128)\n  SQ_INSTS (4096)\n  SQTT size(24)\n    SE(0) size(10)\n    SE(1) size(14)\n"));

    let unit0 = std::fs::read_to_string(out.join("thread_trace_0__gemm_a_se0.out"))?;
    assert_eq!(unit0, "0001\n0002\n0003\n0004\n0005\n");
    let unit1 = std::fs::read_to_string(out.join("thread_trace_2__gemm_b_se1.out"))?;
    assert!(unit1.starts_with("beef\ndead\n"));
    assert!(!out.join("thread_trace_1__reduce_se0.out").exists());

    Ok(())
}

#[tokio::test]
async fn test_range_filter_pull_mode() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dispatches: Vec<String> = (0..6)
        .map(|i| format!(r#"{{ "kernel_name": "k{}", "device_index": 0, "queue_index": {} }}"#, i, i % 2))
        .collect();
    let recording: Recording = serde_json::from_str(&format!(r#"{{ "dispatches": [{}] }}"#, dispatches.join(",")))?;

    let mut config = AgentConfig {
        output_dir: Some(dir.path().to_path_buf()),
        completion: Some(CompletionMode::Pull),
        metrics: vec!["SQ_WAVES".to_string()],
        ..Default::default()
    };
    config.override_filter(Some("2:4"), None, None)?;

    let (results, summary) = run(&config, &recording).await?;

    assert_eq!(summary.observed, 6);
    assert_eq!(summary.collected, 2);
    assert_eq!(summary.swept, 2);
    assert_eq!(headers(&results).len(), 2);
    let timed = results
        .lines()
        .filter(|line| line.starts_with("dispatch[") && line.contains(", time("))
        .count();
    assert_eq!(timed, 2);
    Ok(())
}

#[tokio::test]
async fn test_stalled_completions_are_retried() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let recording: Recording = serde_json::from_str(
        r#"{
            "hardware": { "stall_completions": true },
            "dispatches": [
                { "kernel_name": "a", "device_index": 0, "queue_index": 0 },
                { "kernel_name": "b", "device_index": 0, "queue_index": 1 },
                { "kernel_name": "c", "device_index": 0, "queue_index": 2 }
            ]
        }"#,
    )?;
    let config = AgentConfig {
        output_dir: Some(dir.path().to_path_buf()),
        metrics: vec!["SQ_WAVES".to_string()],
        ..Default::default()
    };

    let (results, summary) = run(&config, &recording).await?;

    assert_eq!(summary.collected, 3);
    assert_eq!(summary.swept, 0);
    let lines: Vec<&str> = results.lines().filter(|l| l.starts_with("dispatch[")).collect();
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| l.contains(", time(")));
    Ok(())
}
