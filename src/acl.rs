// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Access control list evaluation: the `file:`/`princ:`/`deny:`/`gput:`
//! schemes and the tri-state-plus-error outcome each produces.

use std::fs;
use std::path::{Path, PathBuf};

/// The result of checking one ACL entry (or a whole ACL list) against a
/// user. `Deny` always wins over `Permit`, which always wins over
/// `NoMatch`; `Error` short-circuits everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclOutcome {
    Permit,
    NoMatch,
    Deny,
    Error(String),
}

impl AclOutcome {
    fn rank(&self) -> u8 {
        match self {
            AclOutcome::NoMatch => 0,
            AclOutcome::Permit => 1,
            AclOutcome::Deny => 2,
            AclOutcome::Error(_) => 3,
        }
    }

    /// Combine per-file results from a directory `include`: `Error` wins
    /// over `Deny`, which wins over `Permit`, which wins over `NoMatch`.
    fn combine(self, other: AclOutcome) -> AclOutcome {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Filename filter for directory `include`s: only `[A-Za-z0-9_-]+`.
fn valid_filename(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The default scheme used for bare (unprefixed) ACL entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultScheme {
    /// Used for entries in a rule's own ACL list.
    File,
    /// Used for bare entries found inside an included ACL file.
    Princ,
}

/// Checks `user` against a single ACL entry, which may be scheme-prefixed
/// (`file:...`, `princ:...`, `deny:...`, `gput:...`) or bare, in which
/// case `default_scheme` applies. `seen` tracks the stack of files
/// currently being evaluated, to reject recursive `include`s.
pub fn check_entry(user: &str, entry: &str, default_scheme: DefaultScheme, seen: &mut Vec<PathBuf>) -> AclOutcome {
    let (scheme, data) = match entry.split_once(':') {
        Some((scheme, data)) => (scheme, data),
        None => match default_scheme {
            DefaultScheme::File => ("file", entry),
            DefaultScheme::Princ => ("princ", entry),
        },
    };

    match scheme {
        "file" => check_file(user, data, seen),
        "princ" => check_princ(user, data),
        "deny" => check_deny(user, data, seen),
        "gput" => check_gput(user, data),
        other => AclOutcome::Error(format!("invalid ACL scheme '{other}'")),
    }
}

fn check_princ(user: &str, principal: &str) -> AclOutcome {
    if user == principal {
        AclOutcome::Permit
    } else {
        AclOutcome::NoMatch
    }
}

fn check_deny(user: &str, data: &str, seen: &mut Vec<PathBuf>) -> AclOutcome {
    match check_entry(user, data, DefaultScheme::Princ, seen) {
        AclOutcome::Permit => AclOutcome::Deny,
        AclOutcome::NoMatch => AclOutcome::NoMatch,
        AclOutcome::Deny => AclOutcome::NoMatch,
        err @ AclOutcome::Error(_) => err,
    }
}

fn check_gput(_user: &str, data: &str) -> AclOutcome {
    // GPUT support requires linking a system GPUT library this crate does
    // not vendor; a real deployment backs this with one, so an explicit
    // error (rather than a silent deny) surfaces the missing wiring.
    AclOutcome::Error(format!("gput scheme not supported in this build (group '{data}')"))
}

fn check_file(user: &str, path: &str, seen: &mut Vec<PathBuf>) -> AclOutcome {
    let path = PathBuf::from(path);
    if seen.contains(&path) {
        return AclOutcome::Error(format!("{} recursively included", path.display()));
    }

    let metadata = match fs::metadata(&path) {
        Ok(m) => m,
        Err(_) => return AclOutcome::Error(format!("included file {} not found", path.display())),
    };

    seen.push(path.clone());
    let result = if metadata.is_dir() {
        check_dir(user, &path, seen)
    } else {
        check_file_contents(user, &path, seen)
    };
    seen.pop();
    result
}

fn check_dir(user: &str, dir: &Path, seen: &mut Vec<PathBuf>) -> AclOutcome {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return AclOutcome::Error(format!("cannot read directory {}", dir.display())),
    };

    let mut status = AclOutcome::NoMatch;
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if !valid_filename(name) {
            continue;
        }
        let member = dir.join(name);
        let outcome = check_file(user, member.to_string_lossy().as_ref(), seen);
        status = status.combine(outcome);
    }
    status
}

fn check_file_contents(user: &str, path: &Path, seen: &mut Vec<PathBuf>) -> AclOutcome {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return AclOutcome::Error(format!("cannot open ACL file {}", path.display())),
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let outcome = if line.contains(' ') {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("include"), Some(target), None) => {
                    check_entry(user, &format!("file:{target}"), DefaultScheme::File, seen)
                }
                _ => AclOutcome::Error(format!("{}: parse error", path.display())),
            }
        } else {
            check_entry(user, line, DefaultScheme::Princ, seen)
        };
        if outcome != AclOutcome::NoMatch {
            return outcome;
        }
    }
    AclOutcome::NoMatch
}

/// Checks `user` against a rule's full ACL list, short-circuiting on the
/// literal `ANYUSER` wildcard as the first entry, and otherwise returning
/// `true` for the first entry that resolves to `Permit` and `false` as
/// soon as one resolves to `Deny` or `Error` (matching
/// `server_config_acl_permit`'s immediate-stop-on-non-nomatch behavior).
pub fn permitted(user: &str, acls: &[String]) -> bool {
    if acls.first().map(String::as_str) == Some("ANYUSER") {
        return true;
    }
    for acl in acls {
        let mut seen = Vec::new();
        match check_entry(user, acl, DefaultScheme::File, &mut seen) {
            AclOutcome::Permit => return true,
            AclOutcome::NoMatch => continue,
            AclOutcome::Deny | AclOutcome::Error(_) => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn anyuser_short_circuits() {
        assert!(permitted("whoever", &["ANYUSER".to_string()]));
    }

    #[test]
    fn princ_matches_exact_user() {
        let mut seen = Vec::new();
        assert_eq!(
            check_entry("alice@EXAMPLE", "princ:alice@EXAMPLE", DefaultScheme::File, &mut seen),
            AclOutcome::Permit
        );
        assert_eq!(
            check_entry("bob@EXAMPLE", "princ:alice@EXAMPLE", DefaultScheme::File, &mut seen),
            AclOutcome::NoMatch
        );
    }

    #[test]
    fn deny_of_deny_is_nomatch() {
        let mut seen = Vec::new();
        let outcome = check_entry(
            "alice@EXAMPLE",
            "deny:deny:alice@EXAMPLE",
            DefaultScheme::File,
            &mut seen,
        );
        assert_eq!(outcome, AclOutcome::NoMatch);
    }

    #[test]
    fn deny_vetoes_a_matching_principal() {
        let mut seen = Vec::new();
        let outcome = check_entry(
            "alice@EXAMPLE",
            "deny:princ:alice@EXAMPLE",
            DefaultScheme::File,
            &mut seen,
        );
        assert_eq!(outcome, AclOutcome::Deny);
    }

    #[test]
    fn file_scheme_reads_princ_entries_by_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "alice@EXAMPLE").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        assert!(permitted("alice@EXAMPLE", &[path.clone()]));
        assert!(!permitted("bob@EXAMPLE", &[path]));
    }

    #[test]
    fn recursive_include_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();
        std::fs::write(file.path(), format!("include {path}\n")).unwrap();

        assert!(!permitted("alice@EXAMPLE", &[path]));
    }
}
