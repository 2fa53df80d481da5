use std::io::Write;

use priomq::config::{load_config, ENV_WORKER_POOL_SIZE};
use priomq::Config;
use serial_test::serial;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
#[serial]
fn load_config_matches_toml() {
    std::env::remove_var(ENV_WORKER_POOL_SIZE);
    let cfg: Config = load_config("priomq.toml").expect("failed to load config");

    assert_eq!(cfg.broker.url, "memory://localhost");
    assert_eq!(cfg.workers.pool_size, 5);
    assert_eq!(cfg.queues.default_prefetch, 50);
    assert_eq!(cfg.queues.default_priority, 4);
    assert!(cfg.queues.durable);
    assert!(cfg.messages.persistent);
}

#[test]
#[serial]
fn missing_sections_fall_back_to_defaults() {
    std::env::remove_var(ENV_WORKER_POOL_SIZE);
    let file = write_config("[queues]\ndefault_prefetch = 10\n");

    let cfg = load_config(file.path()).unwrap();

    assert_eq!(cfg.queues.default_prefetch, 10);
    assert_eq!(cfg.queues.default_priority, 4);
    assert_eq!(cfg.workers.pool_size, 5);
    assert_eq!(cfg.broker, Config::default().broker);
}

#[test]
#[serial]
fn environment_overrides_pool_size() {
    std::env::set_var(ENV_WORKER_POOL_SIZE, "13");
    let file = write_config("[workers]\npool_size = 2\n");

    let from_file = load_config(file.path()).unwrap();
    let from_env = Config::from_env().unwrap();
    std::env::remove_var(ENV_WORKER_POOL_SIZE);

    assert_eq!(from_file.workers.pool_size, 13);
    assert_eq!(from_env.workers.pool_size, 13);
}

#[test]
#[serial]
fn default_pool_size_without_environment() {
    std::env::remove_var(ENV_WORKER_POOL_SIZE);
    assert_eq!(Config::from_env().unwrap().workers.pool_size, 5);
}

#[test]
#[serial]
fn malformed_environment_value_is_an_error() {
    std::env::set_var(ENV_WORKER_POOL_SIZE, "lots");
    let result = Config::from_env();
    std::env::remove_var(ENV_WORKER_POOL_SIZE);

    assert!(result.is_err());
}

#[test]
#[serial]
fn invalid_values_are_rejected() {
    std::env::remove_var(ENV_WORKER_POOL_SIZE);
    for bad in [
        "[queues]\ndefault_priority = 10\n",
        "[queues]\ndefault_prefetch = 0\n",
        "[workers]\npool_size = 0\n",
        "[broker]\nurl = \"  \"\n",
    ] {
        let file = write_config(bad);
        assert!(load_config(file.path()).is_err(), "accepted: {bad}");
    }
}
