//! Credential issuance against a manually advanced clock

use chrono::{Duration, Utc};
use remotedesk_core::credentials::{should_allow_connection, DEVICE_CODE_LEN};
use remotedesk_core::{
    AccessCodeError, Clock, CredentialIssuer, CredentialsConfig, ManualClock, PlatformTag,
};
use std::collections::HashSet;
use std::sync::Arc;

fn issuer() -> (Arc<ManualClock>, CredentialIssuer) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let issuer = CredentialIssuer::new(CredentialsConfig::default(), clock.clone());
    (clock, issuer)
}

#[test]
fn test_access_code_valid_until_ten_minutes() {
    let (clock, issuer) = issuer();
    let device = issuer.register_device(PlatformTag::Windows).unwrap();
    let start = clock.now();

    let early = issuer.issue_access_code(&device.device_id).unwrap();
    let late = issuer.issue_access_code(&device.device_id).unwrap();
    assert_eq!(early.expires_at - early.issued_at, Duration::minutes(10));

    clock.set(start + Duration::minutes(9) + Duration::seconds(59));
    let used = issuer.validate_access_code(&early.code).unwrap();
    assert!(used.used);
    assert_eq!(
        issuer.validate_access_code(&early.code).unwrap_err(),
        AccessCodeError::AlreadyUsed
    );

    clock.set(start + Duration::minutes(10) + Duration::seconds(1));
    assert_eq!(
        issuer.validate_access_code(&late.code).unwrap_err(),
        AccessCodeError::Expired
    );
    assert_eq!(issuer.purge_expired_access_codes(), 2);
    assert_eq!(
        issuer.validate_access_code(&late.code).unwrap_err(),
        AccessCodeError::NotFound
    );
}

#[test]
fn test_identities_are_distinct() {
    let (_clock, issuer) = issuer();
    let mut ids = HashSet::new();
    let mut codes = HashSet::new();

    for _ in 0..500 {
        let identity = issuer.register_device(PlatformTag::Linux).unwrap();
        assert_eq!(identity.device_code.len(), DEVICE_CODE_LEN);
        assert!(identity.device_code.chars().all(|c| c.is_ascii_digit()));
        assert!(ids.insert(identity.device_id));
        assert!(codes.insert(identity.device_code));
    }
}

#[test]
fn test_disabled_remote_control_ignores_password() {
    let (_clock, issuer) = issuer();
    let mut credential = issuer.new_credential();
    let password = credential.connection_password.clone();
    assert!(should_allow_connection(&credential, &password));

    credential.allow_remote_control = false;
    assert!(!should_allow_connection(&credential, &password));

    credential.allow_remote_control = true;
    issuer.refresh(&mut credential).unwrap();
    assert_ne!(credential.connection_password, password);
    assert!(!should_allow_connection(&credential, &password));
}
