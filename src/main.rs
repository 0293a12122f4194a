mod checker;
mod compiler;
mod config;
mod core;
mod error;
mod executor;
mod judger;
mod languages;
mod pipeline;
mod sandbox;
mod services;
mod storage;
#[cfg(test)]
mod testing;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::JudgeConfig;
use crate::core::{JudgeStage, Properties};
use crate::judger::JudgeFactory;
use crate::pipeline::SolutionResult;
use crate::services::JudgeServices;

/// Per-test settings file inside a test directory
const TEST_SETTINGS: &str = "test.toml";

/// One line of CLI output
#[derive(Debug, Serialize)]
struct TestReport<'a> {
    test: &'a str,
    #[serde(flatten)]
    result: SolutionResult,
    /// Stage messages as a contestant may see them
    public_messages: BTreeMap<JudgeStage, String>,
}

impl<'a> TestReport<'a> {
    fn new(test: &'a str, result: SolutionResult) -> Self {
        let public_messages = result
            .error_messages
            .keys()
            .filter_map(|stage| Some((*stage, result.public_message(*stage)?.to_string())))
            .collect();
        Self {
            test,
            result,
            public_messages,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("judge_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let (Some(source), tests) = (args.next(), args.map(PathBuf::from).collect::<Vec<_>>()) else {
        anyhow::bail!("usage: judge-core <source> <test-dir>...");
    };

    let config = JudgeConfig::from_env();
    info!(
        "Starting judge (watchdog: {}, chroot: {:?})",
        config.watchdog_binary, config.chroot_template
    );
    let services = Arc::new(JudgeServices::new(config)?);
    info!("Supported languages: {:?}", services.languages.supported_languages());

    let factory = JudgeFactory::new(services.clone());
    let defaults = default_properties();
    let judge = factory.create(&defaults)?;

    judge.compile(&[PathBuf::from(source)]).await?;
    let status = judge.current_status().await;
    if judge.is_compiled().await {
        info!("Compilation succeeded");
    } else {
        warn!(
            "Compilation failed: {}",
            status.verdict.map_or("unknown".to_string(), |v| v.to_string())
        );
    }
    println!("{}", serde_json::to_string(&TestReport::new("compile", status))?);

    // Each test runs on a judge rebuilt from the serialized snapshot, as a
    // remote worker would.
    let snapshot = serde_json::to_string(&judge.snapshot().await?)?;

    for dir in &tests {
        match judge_test(&factory, &snapshot, &defaults, dir).await {
            Ok(result) => {
                let name = dir.display().to_string();
                println!("{}", serde_json::to_string(&TestReport::new(&name, result))?);
            }
            Err(e) => error!("Failed to judge test {:?}: {:#}", dir, e),
        }
    }

    if let Err(e) = services.janitor.clean_up(&judge.id()) {
        warn!("Cleanup failed: {:#}", e);
    }
    judge.close_local().await?;
    judge.close_shared().await?;

    info!("Judged {} test(s)", tests.len());
    Ok(())
}

async fn judge_test(
    factory: &JudgeFactory,
    snapshot: &str,
    defaults: &Properties,
    dir: &Path,
) -> Result<SolutionResult> {
    let properties = test_properties(defaults, dir).await?;
    let max_score = JudgeFactory::maximum_score_for_test(&properties)?;
    let files = test_files(dir).await?;

    let worker = factory.restore(serde_json::from_str(snapshot)?).await?;
    let result = worker.run(&files, true, max_score, &properties).await;
    worker.close_local().await?;
    result
}

/// Settings every test starts from, overridable through `JUDGE_TEST_*`
fn default_properties() -> Properties {
    [
        ("consoleIO", "JUDGE_TEST_CONSOLE_IO", "true"),
        ("cpuTimeLimit", "JUDGE_TEST_CPU_TIME_LIMIT", "1000"),
        ("realTimeLimit", "JUDGE_TEST_REAL_TIME_LIMIT", "3000"),
        ("memoryLimit", "JUDGE_TEST_MEMORY_LIMIT", "268435456"),
        ("diskLimit", "JUDGE_TEST_DISK_LIMIT", "67108864"),
        ("maximumScorePerTest", "JUDGE_TEST_MAX_SCORE", "1"),
    ]
    .into_iter()
    .map(|(key, var, default)| {
        let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
        (key.to_string(), value)
    })
    .collect()
}

async fn test_properties(defaults: &Properties, dir: &Path) -> Result<Properties> {
    let mut properties = defaults.clone();
    let settings = dir.join(TEST_SETTINGS);
    if !settings.is_file() {
        return Ok(properties);
    }

    let content = fs::read_to_string(&settings)
        .await
        .with_context(|| format!("Failed to read {:?}", settings))?;
    let table: toml::Table =
        toml::from_str(&content).with_context(|| format!("Invalid test settings {:?}", settings))?;
    for (key, value) in table {
        let value = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        properties.insert(key, value);
    }
    Ok(properties)
}

async fn test_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list test directory {:?}", dir))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CompileOutcome, Pipeline};

    #[tokio::test]
    async fn test_settings_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(TEST_SETTINGS),
            "cpuTimeLimit = 2500\nmaximumScorePerTest = 2.5\nconsoleIO = false\n",
        )
        .unwrap();
        let defaults = Properties::from([
            ("cpuTimeLimit".to_string(), "1000".to_string()),
            ("diskLimit".to_string(), "1024".to_string()),
        ]);

        let properties = test_properties(&defaults, dir.path()).await.unwrap();

        assert_eq!(properties["cpuTimeLimit"], "2500");
        assert_eq!(properties["maximumScorePerTest"], "2.5");
        assert_eq!(properties["consoleIO"], "false");
        assert_eq!(properties["diskLimit"], "1024");
    }

    #[test]
    fn test_report_hides_platform_diagnostics() {
        let failed = Pipeline::new()
            .compile_stage(Ok(CompileOutcome::Ok))
            .unwrap()
            .runtime_stage(Err(anyhow::anyhow!("verdict file missing")))
            .unwrap_err();

        let report = TestReport::new("t1", failed.state().build());

        assert_eq!(
            report.public_messages.get(&JudgeStage::Runtime).map(String::as_str),
            Some("internal error")
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["test"], "t1");
        assert_eq!(json["verdict"], "internal_error");
    }

    #[tokio::test]
    async fn test_files_lists_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("output.txt"), "").unwrap();
        std::fs::write(dir.path().join("input.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("extra")).unwrap();

        let files = test_files(dir.path()).await.unwrap();

        assert_eq!(
            files,
            vec![dir.path().join("input.txt"), dir.path().join("output.txt")]
        );
    }
}
