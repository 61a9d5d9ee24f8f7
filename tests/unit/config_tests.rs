//! Configuration parsing, validation, and layering.

use botfleet::config::{Credentials, GlobalConfig};

#[test]
fn defaults_parse_from_empty_object() {
    let config = GlobalConfig::from_json_str("{}").expect("defaults");
    assert_eq!(config.slack.poll_interval_secs, 10);
    assert_eq!(config.meet.max_parallel, 3);
    assert_eq!(config.meet.grace_secs, 300);
}

#[test]
fn zero_max_parallel_rejected() {
    let raw = r#"{"meet": {"max_parallel": 0}}"#;
    assert!(GlobalConfig::from_json_str(raw).is_err());
}

#[test]
fn inverted_sync_delays_rejected() {
    let raw = r#"{"slack": {"sync": {"min_delay_secs": 5.0, "max_delay_secs": 1.0}}}"#;
    assert!(GlobalConfig::from_json_str(raw).is_err());
}

#[test]
fn missing_file_yields_defaults_but_garbage_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let absent = dir.path().join("nope.json");
    assert!(GlobalConfig::load_from_path(&absent).is_ok());

    let garbled = dir.path().join("config.json");
    std::fs::write(&garbled, "{not json").expect("write");
    assert!(GlobalConfig::load_from_path(&garbled).is_err());
}

#[test]
fn derived_paths_follow_the_daemon_name() {
    let config = GlobalConfig::from_json_str("{}").expect("defaults");
    assert!(config.db_path("slack").ends_with("slack.db"));
    assert!(config.state_file("meet").ends_with("meet_state.json"));
    assert!(config.photo_dir().ends_with("photos"));
}

#[test]
fn credentials_debug_is_redacted() {
    let creds = Credentials {
        slack_token: "xoxb-secret".into(),
        calendar_token: String::new(),
    };
    let rendered = format!("{creds:?}");
    assert!(!rendered.contains("xoxb-secret"));
}

// Environment mutation is process-global, so these run serialized.

#[test]
#[serial_test::serial(botfleet_env)]
fn env_overrides_replace_scalar_fields() {
    std::env::set_var("BOTFLEET_SLACK_POLL_INTERVAL_SECS", "42");
    std::env::set_var("BOTFLEET_MEET_MAX_PARALLEL", "7");

    let mut config = GlobalConfig::from_json_str("{}").expect("defaults");
    config.apply_env_overrides();

    std::env::remove_var("BOTFLEET_SLACK_POLL_INTERVAL_SECS");
    std::env::remove_var("BOTFLEET_MEET_MAX_PARALLEL");

    assert_eq!(config.slack.poll_interval_secs, 42);
    assert_eq!(config.meet.max_parallel, 7);
}

#[test]
#[serial_test::serial(botfleet_env)]
fn unparseable_env_values_are_ignored() {
    std::env::set_var("BOTFLEET_MEET_GRACE_SECS", "not-a-number");

    let mut config = GlobalConfig::from_json_str("{}").expect("defaults");
    config.apply_env_overrides();

    std::env::remove_var("BOTFLEET_MEET_GRACE_SECS");

    assert_eq!(config.meet.grace_secs, 300);
}

#[test]
#[serial_test::serial(botfleet_env)]
fn env_token_wins_over_credentials_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.json");
    std::fs::write(
        dir.path().join("credentials.json"),
        r#"{"slack_token": "from-file"}"#,
    )
    .expect("write credentials");

    std::env::set_var("SLACK_TOKEN", "from-env");
    let creds = GlobalConfig::load_credentials(&config_path).expect("load");
    std::env::remove_var("SLACK_TOKEN");

    assert_eq!(creds.slack_token, "from-env");
}

#[test]
#[serial_test::serial(botfleet_env)]
fn credentials_file_is_used_when_env_is_absent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.json");
    std::fs::write(
        dir.path().join("credentials.json"),
        r#"{"slack_token": "from-file", "calendar_token": "cal-file"}"#,
    )
    .expect("write credentials");

    std::env::remove_var("SLACK_TOKEN");
    std::env::remove_var("CALENDAR_TOKEN");
    let creds = GlobalConfig::load_credentials(&config_path).expect("load");

    assert_eq!(creds.slack_token, "from-file");
    assert_eq!(creds.calendar_token, "cal-file");
}
