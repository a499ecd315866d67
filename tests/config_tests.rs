//! Configuration loading and validation through the public API.

use hoist::config::{ConfigError, HoistConfig};
use hoist::test_support::{EnvGuard, test_config};
use rstest::{fixture, rstest};

#[fixture]
fn valid_config() -> HoistConfig {
    test_config("/tmp/hoist-config-tests")
}

#[rstest]
fn validation_errors_name_env_var_and_config_file(valid_config: HoistConfig) {
    let cfg = HoistConfig {
        kv_dir: String::new(),
        ..valid_config
    };

    let message = cfg
        .validate()
        .expect_err("empty kv_dir should fail")
        .to_string();
    assert!(message.contains("HOIST_KV_DIR"), "message: {message}");
    assert!(message.contains("hoist.toml"), "message: {message}");
    assert!(message.contains("kv_dir"), "message: {message}");
}

#[rstest]
#[case::sweep_interval("sweep_interval_secs")]
#[case::sweep_lock("sweep_lock_ttl_secs")]
#[case::connect_timeout("connect_timeout_secs")]
fn zero_durations_are_rejected(valid_config: HoistConfig, #[case] field: &str) {
    let mut cfg = valid_config;
    match field {
        "sweep_interval_secs" => cfg.sweep_interval_secs = 0,
        "sweep_lock_ttl_secs" => cfg.sweep_lock_ttl_secs = 0,
        _ => cfg.connect_timeout_secs = 0,
    }

    let err = cfg.validate().expect_err("zero should fail");
    assert!(
        matches!(err, ConfigError::InvalidValue { field: ref name, .. } if name == field),
        "unexpected error: {err}"
    );
}

#[rstest]
#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("HOIST_KV_DIR", "/srv/hoist/kv"),
        ("HOIST_LOCK_TTL_SECS", "120"),
        ("HOIST_AGENT_INSTALL_TEMPLATE", "helm install agent-{{cluster-code}}"),
    ])
    .await;

    let cfg = HoistConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(cfg.kv_dir, "/srv/hoist/kv");
    assert_eq!(cfg.lock_ttl_secs, 120);
    assert_eq!(
        cfg.agent_install_template.as_deref(),
        Some("helm install agent-{{cluster-code}}")
    );
    assert_eq!(cfg.sweep_interval_secs, 30);
    assert!(cfg.validate().is_ok());
}
