use skill_sync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const TEST_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("SKILLSYNC_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn set_env(key: &str, value: &str) {
    unsafe {
        env::set_var(key, value);
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_only_required_values_present() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_CRYPTO_KEY", TEST_KEY);
    set_env("SKILLSYNC_OPERATOR_TOKEN", "local-operator");

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.operator_tokens, vec!["local-operator".to_string()]);
    assert_eq!(cfg.crypto_key.as_ref().map(Vec::len), Some(32));
    assert_eq!(cfg.sync.page_size, 50);
    assert_eq!(cfg.dispatch.lanes, 4);
    assert_eq!(cfg.token_refresh.margin_seconds, 120);
    assert!(cfg.webhook_github_secret.is_none());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "SKILLSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "SKILLSYNC_API_BIND_ADDR=192.168.0.10:5000\nSKILLSYNC_SYNC_PAGE_SIZE=25\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "SKILLSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // The profile is chosen by .env.local before the profile files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "SKILLSYNC_PROFILE=test\nSKILLSYNC_API_BIND_ADDR=127.0.0.1:4000\nSKILLSYNC_OPERATOR_TOKEN=layered\nSKILLSYNC_CRYPTO_KEY={TEST_KEY}\n"
        ),
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.sync.page_size, 25);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "SKILLSYNC_API_BIND_ADDR=127.0.0.1:3000\nSKILLSYNC_OPERATOR_TOKEN=from-file\nSKILLSYNC_CRYPTO_KEY={TEST_KEY}\n"
        ),
    );
    set_env("SKILLSYNC_API_BIND_ADDR", "0.0.0.0:9090");

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.operator_tokens, vec!["from-file".to_string()]);

    clear_env();
}

#[test]
fn unprefixed_keys_are_ignored() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "API_BIND_ADDR=127.0.0.1:1\nSKILLSYNC_OPERATOR_TOKEN=t\nSKILLSYNC_CRYPTO_KEY={TEST_KEY}\n"
        ),
    );

    let cfg = loader(&temp_dir).load().expect("config loads");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    clear_env();
}

#[test]
fn operator_token_list_and_webhook_secrets_are_read() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_CRYPTO_KEY", TEST_KEY);
    set_env("SKILLSYNC_OPERATOR_TOKENS", "tok-alpha, tok-beta ,tok-gamma");
    set_env("SKILLSYNC_WEBHOOK_GITHUB_SECRET", "gh-secret");
    set_env("SKILLSYNC_WEBHOOK_SLACK_SIGNING_SECRET", "slack-secret");

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads");

    assert_eq!(cfg.operator_tokens, vec!["tok-alpha", "tok-beta", "tok-gamma"]);
    assert_eq!(
        cfg.webhook_secret(skill_sync::domain::Provider::Github),
        Some("gh-secret")
    );
    assert_eq!(
        cfg.webhook_secret(skill_sync::domain::Provider::Slack),
        Some("slack-secret")
    );

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("gh-secret"));
    assert!(!redacted.contains("slack-secret"));
    assert!(!redacted.contains("tok-beta"));
    clear_env();
}

#[test]
fn rate_limit_overrides_are_parsed_per_provider() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_CRYPTO_KEY", TEST_KEY);
    set_env("SKILLSYNC_OPERATOR_TOKEN", "t");
    set_env("SKILLSYNC_RATE_LIMIT_OVERRIDE_GITHUB_BASE_SECONDS", "5");
    set_env("SKILLSYNC_RATE_LIMIT_OVERRIDE_GITHUB_MAX_RETRIES", "2");

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads");

    let github = cfg
        .rate_limit_policy
        .provider_overrides
        .get("github")
        .expect("github override");
    assert_eq!(github.base_seconds, Some(5));
    assert_eq!(github.max_retries, Some(2));
    assert!(github.max_seconds.is_none());
    clear_env();
}

#[test]
fn missing_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_OPERATOR_TOKEN", "t");

    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("key is required");
    assert!(matches!(err, ConfigError::MissingCryptoKey));
    clear_env();
}

#[test]
fn missing_operator_tokens_are_rejected() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_CRYPTO_KEY", TEST_KEY);

    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("tokens are required");
    assert!(matches!(err, ConfigError::MissingOperatorTokens));
    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_API_BIND_ADDR", "not-an-addr");
    set_env("SKILLSYNC_CRYPTO_KEY", TEST_KEY);
    set_env("SKILLSYNC_OPERATOR_TOKEN", "t");

    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn out_of_range_sync_page_size_is_rejected() {
    let _guard = env_guard();
    clear_env();
    set_env("SKILLSYNC_CRYPTO_KEY", TEST_KEY);
    set_env("SKILLSYNC_OPERATOR_TOKEN", "t");
    set_env("SKILLSYNC_SYNC_PAGE_SIZE", "500");

    let temp_dir = TempDir::new().unwrap();
    let err = loader(&temp_dir).load().expect_err("page size too large");
    assert!(matches!(err, ConfigError::InvalidPageSize { value: 500 }));
    clear_env();
}
