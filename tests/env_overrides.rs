//! Environment overrides of the service configuration.
//!
//! Kept in its own test binary: it mutates the process environment.

use std::env;
use usersvc::config;

#[test]
fn test_numeric_looking_env_values() {
    unsafe {
        env::set_var("USERSVC_CONSUL__TOKEN", "123456");
        env::set_var("USERSVC_CONSUL__SERVICE_ID", "42");
        env::set_var("USERSVC_CONSUL__DATACENTER", "2024");
        env::set_var("USERSVC_CONSUL__SERVICE_NAME", "user");
        env::set_var("USERSVC_CONSUL__SERVICE_PORT", "17191");
        env::set_var("USERSVC_LOG__REPORT_CALLER", "false");
    }

    let loaded = config::load(None, None);

    unsafe {
        for key in [
            "USERSVC_CONSUL__TOKEN",
            "USERSVC_CONSUL__SERVICE_ID",
            "USERSVC_CONSUL__DATACENTER",
            "USERSVC_CONSUL__SERVICE_NAME",
            "USERSVC_CONSUL__SERVICE_PORT",
            "USERSVC_LOG__REPORT_CALLER",
        ] {
            env::remove_var(key);
        }
    }

    let loaded = loaded.unwrap();
    assert!(!loaded.log.report_caller);

    let consul = loaded.consul.unwrap();
    assert_eq!(consul.token.as_deref(), Some("123456"));
    assert_eq!(consul.service_id, "42");
    assert_eq!(consul.datacenter.as_deref(), Some("2024"));
    assert_eq!(consul.service_port, 17191);
}
