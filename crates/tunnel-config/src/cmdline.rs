//! A configuration source built from `-c key=value` options.

use config::{ConfigError, Source, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Alias for the Result type from config.
type Result<T> = std::result::Result<T, ConfigError>;

/// A set of command-line options that override the configuration.
///
/// Each option is one line of TOML.  Dotted keys name sections, so
/// `socks.listen_addr="0.0.0.0"` sets `listen_addr` in `[socks]`.  As a
/// convenience, a value made only of word characters, dots, colons,
/// slashes and hyphens (not leading) doesn't need quotes: `community.listen=0.0.0.0:7759`
/// works.  The `config` crate converts such strings to numbers or
/// booleans when the target field wants one.
#[derive(Debug, Clone)]
pub struct CmdLine {
    /// Name used for error messages about the whole set of options.
    origin: String,
    /// Options in the order they were given.
    lines: Vec<String>,
}

impl Default for CmdLine {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdLine {
    /// Make a new empty set of options.
    pub fn new() -> Self {
        CmdLine {
            origin: "command line".to_string(),
            lines: Vec::new(),
        }
    }

    /// Add one line of TOML.
    pub fn push_toml_line(&mut self, line: String) {
        self.lines.push(line);
    }

    /// Return true if no options were given.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Rewrite a toml parse error so that it names the option that
    /// caused it rather than a line number in a document the user never
    /// wrote.
    fn describe_toml_error(&self, msg: &str, pos: Option<(usize, usize)>) -> String {
        /// Matches the location suffix the toml crate adds.
        static LOCATION: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(.*?) at line [0-9]+ column [0-9]+$").expect("Can't compile regex")
        });
        let msg = LOCATION
            .captures(msg)
            .and_then(|c| c.get(1))
            .map_or(msg, |m| m.as_str());

        match pos.and_then(|(line, _)| self.lines.get(line)) {
            Some(opt) => format!("{} in {:?}", msg, opt),
            None => format!("{} on {}", msg, self.origin),
        }
    }

    /// Join the options into one TOML document.
    fn to_toml(&self) -> String {
        self.lines
            .iter()
            .map(|line| quote_bareword(line).unwrap_or_else(|| line.clone()))
            .fold(String::new(), |mut doc, line| {
                doc.push_str(&line);
                doc.push('\n');
                doc
            })
    }
}

impl Source for CmdLine {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<HashMap<String, Value>> {
        let doc = self.to_toml();
        let value: toml::Value = toml::from_str(&doc).map_err(|e| {
            ConfigError::Message(self.describe_toml_error(&e.to_string(), e.line_col()))
        })?;

        value
            .try_into()
            .map_err(|e| ConfigError::Foreign(Box::new(e)))
    }
}

/// If `s` has the form `key=bareword`, return it with the bareword
/// quoted.  Otherwise return None.
///
/// Booleans and numbers count as barewords too; `config` turns them
/// back into the right type on deserialization.
fn quote_bareword(s: &str) -> Option<String> {
    /// Matches a dotted key, `=`, and one unquoted word.
    static BAREWORD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r#"(?x:
               ^
                [ \t]*
                # dotted key
                ((?:[a-zA-Z0-9_\-]+\.)*
                 [a-zA-Z0-9_\-]+)
                [ \t]*=[ \t]*
                # the value: no quotes, brackets, braces or spaces
                ([a-zA-Z0-9_/][a-zA-Z0-9_.:/\-]*)
                [ \t]*
                $)"#,
        )
        .expect("Built-in regex compilation failed")
    });

    BAREWORD
        .captures(s)
        .map(|c| format!("{}=\"{}\"", &c[1], &c[2]))
}
