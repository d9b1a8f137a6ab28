//! Matching of process command lines into named groups.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use glob::Pattern;

/// True when the rule contains glob metacharacters and must be matched as a
/// pattern rather than compared to the executable name.
fn is_pattern(rule: &str) -> bool {
    rule.contains(['*', '?', '[', ']'])
}

/// A compiled set of command match rules.
///
/// Plain rules match the basename of the executable exactly. Rules with
/// glob metacharacters are matched against the full space-joined command
/// line. Processes without a command line only match the `*` rule.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    executables: HashSet<String>,
    patterns: Vec<Pattern>,
    match_all: bool,
}

impl CommandFilter {
    /// Compiles the rule list. At least one rule is required: a filter that
    /// can never match hides a configuration mistake.
    pub fn new<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut executables = HashSet::new();
        let mut patterns = Vec::new();
        let mut match_all = false;
        for rule in rules {
            let rule = rule.as_ref();
            if rule == "*" {
                match_all = true;
            } else if is_pattern(rule) {
                let pattern = Pattern::new(rule)
                    .with_context(|| format!("invalid command pattern {rule:?}"))?;
                patterns.push(pattern);
            } else {
                executables.insert(rule.to_string());
            }
        }
        if !match_all && executables.is_empty() && patterns.is_empty() {
            bail!("command filter without any match rules");
        }
        Ok(CommandFilter {
            executables,
            patterns,
            match_all,
        })
    }

    pub fn matches(&self, command: Option<&[String]>) -> bool {
        let command = match command {
            Some(command) if !command.is_empty() => command,
            _ => return self.match_all,
        };
        if self.match_all {
            return true;
        }
        if let Some(name) = Path::new(&command[0]).file_name().and_then(|n| n.to_str()) {
            if self.executables.contains(name) {
                return true;
            }
        }
        let command_line = command.join(" ");
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(&command_line))
    }
}

/// Which processes a tracked group covers. The catch-all group takes every
/// process of its owner, named groups take whatever their filter matches.
#[derive(Debug, Clone)]
pub enum GroupSelector {
    AllProcesses,
    Commands(CommandFilter),
}

impl GroupSelector {
    pub fn matches(&self, command: Option<&[String]>) -> bool {
        match self {
            GroupSelector::AllProcesses => true,
            GroupSelector::Commands(filter) => filter.matches(command),
        }
    }
}
