//! User identities backed by an `authorized_keys` file.
//!
//! Each line is `[options] <key-type> <base64-blob> <username>`; the trailing
//! comment names the user the key belongs to. A login is the username
//! optionally followed by dot-separated subdomain segments
//! (`alice.dev.blog` claims `blog.dev` under `alice`).

use crate::error::{TunnelError, TunnelResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Hex-encoded SHA-256 of a raw key blob.
pub fn fingerprint(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

/// A resolved login: the account plus the subdomain it claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    /// Most specific segment first.
    pub subdomain: Vec<String>,
}

/// Resolves logins to principals.
pub trait UserDirectory: Send + Sync {
    fn lookup_user(&self, login: &str) -> Option<Principal>;
}

/// A single public key entry.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub key_type: String,
    pub blob: Vec<u8>,
    pub fingerprint: String,
}

/// Users and their keys, keyed by username.
#[derive(Debug, Default, Clone)]
pub struct AuthorizedUsers {
    users: BTreeMap<String, Vec<AuthorizedKey>>,
}

impl AuthorizedUsers {
    pub fn parse(content: &str) -> Self {
        let mut users: BTreeMap<String, Vec<AuthorizedKey>> = BTreeMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((user, key)) => users.entry(user).or_default().push(key),
                None => warn!(line = lineno + 1, "skipping malformed authorized_keys entry"),
            }
        }
        Self { users }
    }

    /// Load from disk. A missing file yields an empty directory.
    pub fn load(path: &Path) -> TunnelResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "authorized_keys not found, no users loaded");
                Ok(Self::default())
            }
            Err(e) => Err(TunnelError::Config(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn keys(&self, user: &str) -> &[AuthorizedKey] {
        self.users.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[AuthorizedKey])> {
        self.users.iter().map(|(u, k)| (u.as_str(), k.as_slice()))
    }

    /// Whether `blob` of `key_type` is registered for the user behind `login`.
    pub fn check_key(&self, login: &str, key_type: &str, blob: &[u8]) -> bool {
        let Some(principal) = self.lookup_user(login) else {
            return false;
        };
        self.keys(&principal.name)
            .iter()
            .any(|k| k.key_type == key_type && k.blob == blob)
    }
}

impl UserDirectory for AuthorizedUsers {
    fn lookup_user(&self, login: &str) -> Option<Principal> {
        if !valid_login(login) {
            return None;
        }
        let mut segments = login.split('.');
        let name = segments.next()?;
        if !self.users.contains_key(name) {
            return None;
        }
        let mut subdomain: Vec<String> = segments.map(str::to_string).collect();
        subdomain.reverse();
        Some(Principal {
            name: name.to_string(),
            subdomain,
        })
    }
}

fn parse_line(line: &str) -> Option<(String, AuthorizedKey)> {
    let line = line.trim_start();
    let first = line.split_whitespace().next()?;
    let rest = if looks_like_key_type(first) {
        line
    } else {
        skip_options(line)?
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let [key_type, encoded, user, ..] = fields.as_slice() else {
        return None;
    };
    if !looks_like_key_type(key_type) || !valid_username(user) {
        return None;
    }
    let blob = STANDARD.decode(encoded).ok()?;
    let key = AuthorizedKey {
        key_type: key_type.to_string(),
        fingerprint: fingerprint(&blob),
        blob,
    };
    Some((user.to_string(), key))
}

/// Skip a leading options field, which may contain quoted whitespace
/// (`command="echo hi",no-pty`). `None` if a quote is left open.
fn skip_options(line: &str) -> Option<&str> {
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => return Some(&line[i..]),
            _ => {}
        }
    }
    None
}

fn looks_like_key_type(field: &str) -> bool {
    field.starts_with("ssh-") || field.starts_with("ecdsa-") || field.starts_with("sk-")
}

fn valid_username(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// `^[A-Za-z0-9]+(\.[A-Za-z0-9]+)*$`
fn valid_login(login: &str) -> bool {
    login.split('.').all(valid_username)
}

/// Public hostname for a principal and its subdomain claim.
///
/// `("alice", ["blog", "dev"], "apparea.dev")` → `blog-dev-alice.apparea.dev`.
pub fn virtual_hostname(principal: &str, segments: &[String], base: &str) -> String {
    if segments.is_empty() {
        format!("{principal}.{base}")
    } else {
        format!("{}-{principal}.{base}", segments.join("-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIA==";
    const BLOB_B: &str = "AAAAB3NzaC1yc2EAAAADAQAB";

    fn users() -> AuthorizedUsers {
        AuthorizedUsers::parse(&format!(
            "# comment\n\
             ssh-ed25519 {BLOB_A} alice\n\
             \n\
             ssh-rsa {BLOB_B} alice\n\
             no-pty ssh-ed25519 {BLOB_B} bob\n\
             ssh-ed25519 !!!notbase64 carol\n\
             ssh-ed25519 {BLOB_A}\n"
        ))
    }

    #[test]
    fn keys_accumulate_per_user() {
        let users = users();
        assert_eq!(users.len(), 2);
        assert_eq!(users.keys("alice").len(), 2);
        assert_eq!(users.keys("bob").len(), 1);
        assert!(users.keys("carol").is_empty());
    }

    #[test]
    fn quoted_options_may_contain_spaces() {
        let users = AuthorizedUsers::parse(&format!(
            "command=\"echo hi\",no-pty ssh-ed25519 {BLOB_A} dave\n\
             environment=\"A=\\\"x y\\\"\" ssh-rsa {BLOB_B} erin\n\
             command=\"unterminated ssh-ed25519 {BLOB_A} frank\n"
        ));
        assert_eq!(users.keys("dave").len(), 1);
        assert_eq!(users.keys("dave")[0].key_type, "ssh-ed25519");
        assert_eq!(users.keys("erin").len(), 1);
        assert!(users.keys("frank").is_empty());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let users = users();
        let fp = &users.keys("bob")[0].fingerprint;
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(*fp, fingerprint(&STANDARD.decode(BLOB_B).unwrap()));
    }

    #[test]
    fn lookup_plain_user() {
        let p = users().lookup_user("alice").unwrap();
        assert_eq!(p.name, "alice");
        assert!(p.subdomain.is_empty());
    }

    #[test]
    fn lookup_reverses_subdomain() {
        let p = users().lookup_user("alice.dev.blog").unwrap();
        assert_eq!(p.name, "alice");
        assert_eq!(p.subdomain, vec!["blog".to_string(), "dev".to_string()]);
    }

    #[test]
    fn invalid_logins_rejected() {
        let users = users();
        for login in ["", "alice.", ".alice", "alice..dev", "al-ice", "alice.d_v", "mallory"] {
            assert!(users.lookup_user(login).is_none(), "{login:?}");
        }
    }

    #[test]
    fn check_key_matches_type_and_blob() {
        let users = users();
        let a = STANDARD.decode(BLOB_A).unwrap();
        let b = STANDARD.decode(BLOB_B).unwrap();
        assert!(users.check_key("alice", "ssh-ed25519", &a));
        assert!(users.check_key("alice.blog", "ssh-rsa", &b));
        assert!(!users.check_key("alice", "ssh-ed25519", &b));
        assert!(!users.check_key("bob", "ssh-ed25519", &a));
        assert!(!users.check_key("mallory", "ssh-ed25519", &a));
    }

    #[test]
    fn hostname_derivation() {
        assert_eq!(virtual_hostname("alice", &[], "apparea.dev"), "alice.apparea.dev");
        let segs = vec!["blog".to_string(), "dev".to_string()];
        assert_eq!(
            virtual_hostname("alice", &segs, "apparea.dev"),
            "blog-dev-alice.apparea.dev"
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let users = AuthorizedUsers::load(Path::new("/nonexistent/apparea/authorized_keys")).unwrap();
        assert!(users.is_empty());
    }
}
