//! Judge configuration
//!
//! Configuration for the sandbox, storage and compiler layers, loaded from
//! environment variables (a `.env` file is honoured by `main`).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Slack added on top of the requested real-time limit when sizing the
/// external watchdog.
const WATCHDOG_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Privilege escalation wrapper (None runs the watchdog directly)
    pub escalation_command: Option<String>,
    /// Sandbox supervisor binary
    pub watchdog_binary: String,
    /// Read-only jail image copied into every native sandbox
    pub chroot_template: PathBuf,
    /// RAM-backed mount preferred for local scratch spaces
    pub ramdisk_root: PathBuf,
    /// Root reachable by every worker node
    pub shared_storage_root: PathBuf,
    /// Unprivileged account the sandboxed program runs as
    pub sandbox_user: String,
    /// Managed runtime launcher
    pub java_binary: PathBuf,
    pub native_watchdog_timeout: Duration,
    pub managed_watchdog_timeout: Duration,
    pub compile_timeout: Duration,
    /// Bound on creating the sandbox account
    pub provision_timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            escalation_command: Some("sudo".to_string()),
            watchdog_binary: "olympus_watchdog".to_string(),
            chroot_template: PathBuf::from("/usr/chroot"),
            ramdisk_root: PathBuf::from("/tmp/ramdisk"),
            shared_storage_root: PathBuf::from("/tmp"),
            sandbox_user: "olympuswatchdogchild".to_string(),
            java_binary: PathBuf::from("/usr/bin/java"),
            native_watchdog_timeout: Duration::from_secs(60),
            managed_watchdog_timeout: Duration::from_secs(20),
            compile_timeout: Duration::from_secs(20),
            provision_timeout: Duration::from_millis(1000),
        }
    }
}

impl JudgeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let escalation = env::var("JUDGE_ESCALATION_COMMAND")
            .unwrap_or_else(|_| "sudo".to_string());

        Self {
            escalation_command: (!escalation.trim().is_empty()).then(|| escalation.trim().to_string()),
            watchdog_binary: env_parse("JUDGE_WATCHDOG_BINARY", defaults.watchdog_binary),
            chroot_template: env_parse("JUDGE_CHROOT_TEMPLATE", defaults.chroot_template),
            ramdisk_root: env_parse("JUDGE_RAMDISK_ROOT", defaults.ramdisk_root),
            shared_storage_root: env_parse(
                "JUDGE_SHARED_STORAGE_ROOT",
                defaults.shared_storage_root,
            ),
            sandbox_user: env_parse("JUDGE_SANDBOX_USER", defaults.sandbox_user),
            java_binary: env_parse("JUDGE_JAVA_BINARY", defaults.java_binary),
            native_watchdog_timeout: Duration::from_secs(env_parse(
                "JUDGE_NATIVE_WATCHDOG_SECS",
                60u64,
            )),
            managed_watchdog_timeout: Duration::from_secs(env_parse(
                "JUDGE_MANAGED_WATCHDOG_SECS",
                20u64,
            )),
            compile_timeout: Duration::from_secs(env_parse("JUDGE_COMPILE_TIMEOUT_SECS", 20u64)),
            provision_timeout: Duration::from_millis(env_parse(
                "JUDGE_PROVISION_TIMEOUT_MS",
                1000u64,
            )),
        }
    }

    /// Hard timeout for a watchdog invocation; always exceeds the requested
    /// real-time limit.
    pub fn watchdog_timeout(&self, configured: Duration, real_time_limit_ms: u64) -> Duration {
        configured.max(Duration::from_millis(real_time_limit_ms) + WATCHDOG_SLACK)
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
