use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Variables read from the variable file, handed explicitly to every child
/// process instead of being written into this process's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    vars: BTreeMap<String, String>,
}

impl RuntimeEnv {
    /// Load `path` if it exists. A missing file yields `None`; a file that
    /// cannot be opened is an error. Content that stops being readable part
    /// way through keeps the lines parsed before it.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            tracing::info!(path = %path.display(), "no variable file, skipping load");
            return Ok(None);
        }

        let iter = dotenvy::from_path_iter(path).map_err(|source| Error::EnvFile {
            path: path.to_path_buf(),
            source,
        })?;
        let env = Self::collect(iter);

        if env.is_empty() {
            tracing::warn!(path = %path.display(), "variable file defines no variables");
        } else {
            tracing::info!(path = %path.display(), count = env.len(), "loaded variable file");
        }
        Ok(Some(env))
    }

    #[cfg(test)]
    pub fn parse<R: std::io::Read>(reader: R) -> Self {
        Self::collect(dotenvy::from_read_iter(reader))
    }

    fn collect<I>(iter: I) -> Self
    where
        I: Iterator<Item = std::result::Result<(String, String), dotenvy::Error>>,
    {
        let mut vars = BTreeMap::new();
        for item in iter {
            match item {
                Ok((key, value)) => {
                    vars.insert(key, value);
                }
                // Malformed lines are skipped; the rest of the file still applies.
                Err(dotenvy::Error::LineParse(line, index)) => {
                    tracing::warn!(line = %line, index, "skipping malformed line in variable file");
                }
                Err(err) => {
                    tracing::warn!(error = %err, parsed = vars.len(), "stopped reading variable file");
                    break;
                }
            }
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// What a child process will see: `inherited` with this overlay on top.
    pub fn effective(&self, inherited: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = inherited.clone();
        merged.extend(self.vars.clone());
        merged
    }
}

/// Selects which variables appear in the startup listing.
pub struct Diagnostics<'a> {
    patterns: Vec<String>,
    mask: bool,
    vars: &'a BTreeMap<String, String>,
}

impl<'a> Diagnostics<'a> {
    pub fn new(vars: &'a BTreeMap<String, String>, patterns: &[String], mask: bool) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
            mask,
            vars,
        }
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn lines(&self) -> Vec<String> {
        self.vars
            .iter()
            .filter(|(name, _)| self.matches(name))
            .map(|(name, value)| {
                if self.mask {
                    format!("{}={}", name, mask_value(value))
                } else {
                    format!("{}={}", name, value)
                }
            })
            .collect()
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for line in self.lines() {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }
}

pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 10 {
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "***".to_string()
    }
}
