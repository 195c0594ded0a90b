use super::types::*;
use super::ResinConfig;
use std::path::Path;

#[test]
fn test_defaults() {
    let cfg = ResinConfig::default();
    assert!(cfg.proxy.token.is_empty());
    assert_eq!(cfg.transport.max_idle_conns, 1024);
    assert_eq!(cfg.transport.max_idle_per_host, 64);
    assert_eq!(cfg.transport.idle_timeout_secs, 90);
    assert_eq!(cfg.traffic.flush_threshold_bytes, 32 * 1024);
    assert_eq!(cfg.traffic.flush_interval_ms, 1000);
    assert_eq!(cfg.metrics.bucket_seconds, 300);
    assert_eq!(cfg.metrics.latency_bin_ms, 100);
    assert_eq!(cfg.metrics.latency_over_ms, 3000);
    assert_eq!(cfg.metrics.lease_channel_capacity, 8192);
    assert!(cfg.request_log.enabled);
    assert!(!cfg.request_log.reverse_detail_enabled);
    assert_eq!(cfg.request_log.resp_body_cap, -1);
    cfg.validate().unwrap();
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = ResinConfig::load(Path::new("/nonexistent/resin.toml")).unwrap();
    assert!(cfg.platforms.is_empty());
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "proxy": { "token": "tok", "reverse_token": "rtok" },
        "platforms": [{
            "id": "plat-1",
            "name": "plat",
            "default": true,
            "empty_account_behavior": "reject",
            "nodes": [{"address": "127.0.0.1:9001", "tag": "n1", "egress_ip": "203.0.113.7"}]
        }],
        "account_rules": [
            {"prefix": "api.example.com", "headers": ["Authorization"], "updated_at_ns": 1}
        ]
    }"#;
    let tmp = std::env::temp_dir().join("resin_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = ResinConfig::load(&tmp).unwrap();
    assert_eq!(cfg.proxy.token, "tok");
    assert_eq!(cfg.platforms.len(), 1);
    assert!(cfg.platforms[0].is_default);
    assert_eq!(cfg.platforms[0].empty_account_behavior, "reject");
    assert_eq!(cfg.platforms[0].nodes[0].address, "127.0.0.1:9001");
    assert_eq!(cfg.account_rules.len(), 1);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
[proxy]
token = "tok"

[[platforms]]
id = "plat-1"
name = "plat"

[[platforms.nodes]]
address = "10.0.0.1:443"
"#;
    let tmp = std::env::temp_dir().join("resin_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = ResinConfig::load(&tmp).unwrap();
    assert_eq!(cfg.platforms[0].nodes[0].address, "10.0.0.1:443");
    assert_eq!(cfg.platforms[0].empty_account_behavior, "random");
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_empty_platform_id_fails() {
    let cfg = ResinConfig {
        platforms: vec![PlatformConfig {
            id: String::new(),
            name: "plat".into(),
            is_default: false,
            empty_account_behavior: "random".into(),
            nodes: vec![],
        }],
        ..ResinConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_two_defaults_fail() {
    let plat = PlatformConfig {
        id: "p".into(),
        name: "plat".into(),
        is_default: true,
        empty_account_behavior: "random".into(),
        nodes: vec![],
    };
    let cfg = ResinConfig {
        platforms: vec![
            plat.clone(),
            PlatformConfig {
                id: "q".into(),
                name: "other".into(),
                ..plat
            },
        ],
        ..ResinConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_bucket_seconds() {
    let mut cfg = ResinConfig::default();
    cfg.metrics.bucket_seconds = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_empty_rule_prefix_fails() {
    let cfg = ResinConfig {
        account_rules: vec![AccountRuleConfig {
            prefix: "   ".into(),
            headers: vec![],
            updated_at_ns: 0,
        }],
        ..ResinConfig::default()
    };
    assert!(cfg.validate().is_err());
}
