// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The server's rule-file parser: command/subcommand/program/options/ACL
//! lines, `#` comments, backslash line continuation, and recursive
//! `include` of files or directories.

use std::fs;
use std::path::{Path, PathBuf};

use crate::acl;
use crate::error::Error;

/// How the command's `stdin` argument is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinArg {
    /// No argument is fed to the child's stdin.
    None,
    /// The argument at this 1-based index (≥ 2, since argv[1] is the
    /// subcommand) is fed to stdin instead of being passed on argv.
    Index(usize),
    /// The last argument in the request is fed to stdin.
    Last,
}

#[derive(Debug, Clone, Default)]
pub struct RuleOptions {
    pub logmask: Vec<usize>,
    pub stdin_arg: Option<StdinArg>,
}

/// One parsed line of the configuration file.
#[derive(Debug, Clone)]
pub struct Rule {
    pub file: PathBuf,
    pub lineno: usize,
    pub command: String,
    pub subcommand: String,
    pub program: PathBuf,
    pub options: RuleOptions,
    pub acls: Vec<String>,
}

impl Rule {
    /// True if `command`/`subcommand` match this rule; `ALL` in either
    /// field of the rule matches anything.
    pub fn matches(&self, command: &str, subcommand: &str) -> bool {
        self.command == command && (self.subcommand == subcommand || self.subcommand == "ALL")
    }

    pub fn permits(&self, user: &str) -> bool {
        acl::permitted(user, &self.acls)
    }

    /// Renders `argv` as a log-friendly command line, replacing the
    /// arguments named by this rule's `logmask` (1-based indices) with
    /// `**MASKED**` (spec.md "`logmask=N,N,...`").
    pub fn masked_command_line(&self, argv: &[Vec<u8>]) -> String {
        argv.iter()
            .enumerate()
            .map(|(i, arg)| {
                if self.options.logmask.contains(&(i + 1)) {
                    "**MASKED**".to_string()
                } else {
                    String::from_utf8_lossy(arg).into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub rules: Vec<Rule>,
}

impl Config {
    /// Loads and parses the rule file at `path`, following `include`
    /// directives relative to the including file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut config = Config::default();
        read_conf_file(path.as_ref(), &mut config, &mut Vec::new())?;
        Ok(config)
    }

    /// Finds the first rule matching `command`/`subcommand`, in file
    /// order (first match wins, matching the original's linear scan).
    pub fn find(&self, command: &str, subcommand: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(command, subcommand))
    }
}

fn read_conf_file(path: &Path, config: &mut Config, seen: &mut Vec<PathBuf>) -> Result<(), Error> {
    if seen.contains(&path.to_path_buf()) {
        return Err(Error::config(format!("{} recursively included", path.display())));
    }

    let metadata = fs::metadata(path)
        .map_err(|_| Error::config(format!("included file {} not found", path.display())))?;

    if metadata.is_dir() {
        seen.push(path.to_path_buf());
        let mut entries: Vec<_> = fs::read_dir(path)
            .map_err(|_| Error::config(format!("cannot read directory {}", path.display())))?
            .filter_map(Result::ok)
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) if valid_filename(n) => n,
                _ => continue,
            };
            read_conf_file(&path.join(name), config, seen)?;
        }
        seen.pop();
        return Ok(());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot open config file {}: {e}", path.display())))?;
    seen.push(path.to_path_buf());
    let result = parse_lines(path, &contents, config, seen);
    seen.pop();
    result
}

fn valid_filename(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_lines(path: &Path, contents: &str, config: &mut Config, seen: &mut Vec<PathBuf>) -> Result<(), Error> {
    let mut lineno = 0usize;
    let mut logical_lines = logical_lines(contents);

    while let Some((start_lineno, raw)) = logical_lines.next() {
        lineno = start_lineno;
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let fields = split_fields(trimmed);
        if fields.len() == 2 && fields[0] == "include" {
            let target = resolve_include(path, &fields[1]);
            read_conf_file(&target, config, seen)?;
            continue;
        }
        if fields.len() < 4 {
            return Err(Error::config(format!("{}:{lineno}: parse error", path.display())));
        }

        let command = fields[0].clone();
        let subcommand = fields[1].clone();
        let program = PathBuf::from(&fields[2]);

        let mut options = RuleOptions::default();
        let mut idx = 3;
        while idx < fields.len() {
            if !is_option(&fields[idx]) {
                break;
            }
            parse_option(&mut options, &fields[idx], path, lineno)?;
            idx += 1;
        }

        if idx >= fields.len() {
            return Err(Error::config(format!("{}:{lineno}: config parse error", path.display())));
        }

        let acls = fields[idx..].to_vec();

        config.rules.push(Rule {
            file: path.to_path_buf(),
            lineno,
            command,
            subcommand,
            program,
            options,
            acls,
        });
    }

    Ok(())
}

/// Joins backslash-continued physical lines into logical lines, yielding
/// `(starting_line_number, joined_text)`.
fn logical_lines(contents: &str) -> impl Iterator<Item = (usize, String)> + '_ {
    let mut physical = contents.lines().enumerate().peekable();
    std::iter::from_fn(move || {
        let (first_idx, mut joined) = match physical.next() {
            Some((i, line)) => (i, line.to_string()),
            None => return None,
        };
        while joined.ends_with('\\') {
            joined.pop();
            match physical.next() {
                Some((_, next)) => joined.push_str(next),
                None => break,
            }
        }
        Some((first_idx + 1, joined))
    })
}

fn split_fields(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

fn is_option(field: &str) -> bool {
    let mut chars = field.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    match field.split_once('=') {
        Some((name, value)) => {
            !value.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        }
        None => false,
    }
}

fn parse_option(options: &mut RuleOptions, field: &str, path: &Path, lineno: usize) -> Result<(), Error> {
    let (name, value) = field
        .split_once('=')
        .ok_or_else(|| Error::config(format!("{}:{lineno}: invalid option {field}", path.display())))?;

    match name {
        "logmask" => {
            let mut mask = Vec::new();
            for part in value.split(',') {
                let n: usize = part
                    .parse()
                    .map_err(|_| Error::config(format!("{}:{lineno}: invalid logmask parameter {part}", path.display())))?;
                if n == 0 {
                    return Err(Error::config(format!("{}:{lineno}: invalid logmask parameter {part}", path.display())));
                }
                mask.push(n);
            }
            options.logmask = mask;
        }
        "stdin" => {
            options.stdin_arg = Some(if value == "last" {
                StdinArg::Last
            } else {
                let n: usize = value
                    .parse()
                    .map_err(|_| Error::config(format!("{}:{lineno}: invalid stdin value {value}", path.display())))?;
                if n < 2 {
                    return Err(Error::config(format!("{}:{lineno}: invalid stdin value {value}", path.display())));
                }
                StdinArg::Index(n)
            });
        }
        other => {
            return Err(Error::config(format!("{}:{lineno}: unknown option {other}", path.display())));
        }
    }
    Ok(())
}

/// `include` targets resolve relative to the directory of the file that
/// named them, not the process's current directory.
fn resolve_include(including_file: &Path, target: &str) -> PathBuf {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        return target_path.to_path_buf();
    }
    match including_file.parent() {
        Some(dir) => dir.join(target_path),
        None => target_path.to_path_buf(),
    }
}
