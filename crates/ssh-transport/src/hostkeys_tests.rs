use std::{fs, path::PathBuf, process};

use russh::keys::{HashAlg, PublicKey};
use tunnel_types::{Endpoint, HostKeyPolicy};

use super::{HostKeyVerifier, fingerprint_matches};
use crate::SshError;

const SERVER_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILM+rvN+ot98qgEN796jTiQfZfG1KaT0PtFDJ/XFSqti user@example.com";

/// The key as a server presents it: no comment travels on the wire.
fn server_key() -> PublicKey {
    let mut key = PublicKey::from_openssh(SERVER_KEY).expect("valid test key");
    key.set_comment("");
    key
}

fn verifier(policy: HostKeyPolicy) -> HostKeyVerifier {
    HostKeyVerifier::new(Endpoint::new("bastion.internal", 22), policy)
}

fn known_hosts_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("sshtunnel-{name}-{}", process::id()));
    fs::write(&path, contents).expect("write known_hosts");
    path
}

#[test]
fn accept_any_trusts_every_key() {
    assert!(verifier(HostKeyPolicy::AcceptAny).check(&server_key()).unwrap());
}

#[test]
fn pinned_fingerprint_must_match() {
    let fingerprint = server_key().fingerprint(HashAlg::Sha256).to_string();
    assert!(fingerprint.starts_with("SHA256:"));

    let pinned = verifier(HostKeyPolicy::Fingerprint(fingerprint.clone()));
    assert!(pinned.check(&server_key()).unwrap());

    let bare = fingerprint.trim_start_matches("SHA256:").to_string();
    assert!(verifier(HostKeyPolicy::Fingerprint(bare)).check(&server_key()).unwrap());

    let wrong = verifier(HostKeyPolicy::Fingerprint("SHA256:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into()));
    match wrong.check(&server_key()) {
        Err(SshError::HostKey(message)) => assert!(message.contains(&fingerprint), "message: {message}"),
        other => panic!("expected host key rejection, got {other:?}"),
    }
}

#[test]
fn empty_pin_never_matches() {
    assert!(!fingerprint_matches("", "SHA256:abc"));
    assert!(!fingerprint_matches("SHA256:", "SHA256:abc"));
    assert!(fingerprint_matches(" SHA256:abc ", "SHA256:abc"));
}

#[test]
fn known_hosts_entry_is_accepted() {
    let path = known_hosts_file("known", &format!("bastion.internal {SERVER_KEY}\n"));
    let result = verifier(HostKeyPolicy::KnownHosts(path.clone())).check(&server_key());
    let _ = fs::remove_file(&path);
    assert!(result.unwrap());
}

#[test]
fn host_missing_from_known_hosts_is_rejected() {
    let path = known_hosts_file("unknown", &format!("other.internal {SERVER_KEY}\n"));
    let result = verifier(HostKeyPolicy::KnownHosts(path.clone())).check(&server_key());
    let _ = fs::remove_file(&path);
    assert!(matches!(result, Err(SshError::HostKey(_))), "got {result:?}");
}
