mod common;

use common::{config, fresh_card, keys, open, CountingCard};
use memcard::{AuthKeys, AuthState, Config, Error, Session};

#[test]
fn mutations_need_authentication_first() {
    let mut session = Session::open(CountingCard::new(fresh_card()), &config()).expect("open");
    assert_eq!(session.auth().state(), AuthState::Unauthenticated);

    assert!(matches!(session.mkdir("/SAVE"), Err(Error::AuthRequired)));
    assert!(matches!(session.write_file("/FILE", b"x"), Err(Error::AuthRequired)));
    assert!(matches!(session.remove("/FILE"), Err(Error::AuthRequired)));
    assert!(matches!(session.rmdir("/SAVE"), Err(Error::AuthRequired)));
    assert!(matches!(session.erase_card(), Err(Error::AuthRequired)));
    assert!(matches!(session.restore(std::io::empty()), Err(Error::AuthRequired)));

    let card = session.device();
    assert_eq!(card.writes, 0);
    assert_eq!(card.erases, 0);
}

#[test]
fn reads_work_without_authentication() {
    let mut session = open(fresh_card());
    assert!(session.list("/").expect("list").is_empty());
    assert!(session.info().is_ok());
}

#[test]
fn authentication_unlocks_writes() {
    let mut session = open(fresh_card());
    session.authenticate().expect("authenticate");
    assert_eq!(session.auth().state(), AuthState::Authenticated);
    assert!(session.auth().session_key().is_some());
    assert!(session.device().is_authenticated());

    session.mkdir("/SAVE").expect("mkdir");
    assert_eq!(session.list("/").expect("list").len(), 1);
}

#[test]
fn reset_locks_the_session_again() {
    let mut session = open(fresh_card());
    session.authenticate().expect("authenticate");
    session.reset_auth();

    assert_eq!(session.auth().state(), AuthState::Unauthenticated);
    assert!(matches!(session.mkdir("/SAVE"), Err(Error::AuthRequired)));
}

#[test]
fn mismatched_keys_fail_the_handshake() {
    let mut wrong = keys();
    wrong.key_right[0] ^= 0xFF;
    let card = fresh_card().with_keys(wrong);
    let mut session = open(card);

    assert!(matches!(session.authenticate(), Err(Error::AuthFailed(_))));
    assert_eq!(session.auth().state(), AuthState::Failed);
    assert!(!session.device().is_authenticated());
    assert!(matches!(session.mkdir("/SAVE"), Err(Error::AuthRequired)));
}

#[test]
fn missing_host_keys_are_a_config_error() {
    let mut session = Session::open(fresh_card(), &Config::default()).expect("open");
    assert!(matches!(session.authenticate(), Err(Error::Config(_))));
    assert_eq!(session.auth().state(), AuthState::Unauthenticated);
}

#[test]
fn keys_round_trip_through_the_config_file() {
    let source = config().to_toml_string().expect("serialize");
    let loaded = Config::from_toml_str(&source).expect("parse");
    let parsed: AuthKeys = loaded.auth.keys().expect("keys");
    assert_eq!(parsed, keys());
}
