use credential_hub::config::{ConfigLoader, LockBackend};
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
    unsafe {
        for key in [
            "CREDHUB_PROFILE",
            "CREDHUB_API_BIND_ADDR",
            "CREDHUB_LOG_LEVEL",
            "CREDHUB_CRYPTO_KEY",
            "CREDHUB_DATABASE_URL",
            "CREDHUB_LOCK_BACKEND",
            "CREDHUB_REFRESH_LOCK_TTL_MS",
            "CREDHUB_WEBHOOKS_ENABLED",
        ] {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.lock_backend, LockBackend::Database);
    assert_eq!(cfg.refresh.lock_ttl_ms, 10_000);
    assert_eq!(cfg.refresh.default_expiration_buffer_seconds, 900);
    assert!(cfg.webhooks_enabled);
    assert!(cfg.crypto_key.is_none());
    assert!(cfg.database_url.starts_with("sqlite:"));
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "CREDHUB_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "CREDHUB_API_BIND_ADDR=192.168.0.10:5000\nCREDHUB_LOCK_BACKEND=memory\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "CREDHUB_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!("CREDHUB_PROFILE=test\nCREDHUB_API_BIND_ADDR=127.0.0.1:4000\nCREDHUB_CRYPTO_KEY={TEST_KEY}\n"),
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.lock_backend, LockBackend::Memory);
    assert_eq!(cfg.crypto_key.as_deref().map(<[u8]>::len), Some(32));
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
        "CREDHUB_API_BIND_ADDR=127.0.0.1:3000\nCREDHUB_WEBHOOKS_ENABLED=true\n",
    );

    unsafe {
        env::set_var("CREDHUB_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("CREDHUB_WEBHOOKS_ENABLED", "off");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert!(!cfg.webhooks_enabled);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("CREDHUB_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn production_profile_requires_key_and_database() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("CREDHUB_PROFILE", "prod");
        env::set_var("CREDHUB_DATABASE_URL", "postgres://localhost/credhub");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("prod without a crypto key should fail");
    assert!(format!("{}", err).contains("crypto key is missing"));

    unsafe {
        env::set_var("CREDHUB_CRYPTO_KEY", TEST_KEY);
        env::remove_var("CREDHUB_DATABASE_URL");
    }
    let err = loader.load().expect_err("prod without a database url should fail");
    assert!(format!("{}", err).contains("database url is missing"));

    clear_env();
}

#[test]
fn out_of_range_lock_ttl_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("CREDHUB_REFRESH_LOCK_TTL_MS", "500");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("ttl below 1s should fail");
    assert!(format!("{}", err).contains("refresh lock TTL"));

    clear_env();
}
