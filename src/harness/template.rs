//! `{name}` variable expansion for suite files
//!
//! `{{` and `}}` produce literal braces. Referencing an unknown variable is a
//! configuration error rather than an empty string, so a typo in a table
//! cannot silently turn into a different CLI invocation.

use std::collections::BTreeMap;

use crate::common::{Error, Result};

use super::environment::TestEnv;
use super::identity;

/// Variables visible to a scenario
#[derive(Debug, Clone, Default)]
pub struct Vars {
    map: BTreeMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables derived from the suite environment and the host
    pub fn for_environment(env: &TestEnv) -> Result<Self> {
        let mut vars = Self::new();
        vars.insert("image", env.image_path.display().to_string());
        vars.insert("test_dir", env.test_dir.display().to_string());
        vars.insert("cmd_path", env.cmd_path.display().to_string());
        vars.insert("hostname", identity::hostname()?);
        vars.insert("pwd", std::env::current_dir()?.display().to_string());

        let user = identity::current_user()?;
        vars.insert("user.name", user.name);
        vars.insert("user.home", user.home.display().to_string());
        vars.insert("user.uid", user.uid.to_string());
        Ok(vars)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn extend<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.map.extend(pairs);
    }

    /// Substitute every `{name}` in `input`
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    out.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let rest = &input[i + 1..];
                    let end = rest.find('}').ok_or_else(|| {
                        Error::Config(format!("unterminated variable in '{input}'"))
                    })?;
                    let key = &rest[..end];
                    let value = self.get(key).ok_or_else(|| {
                        Error::Config(format!("unknown variable {{{key}}} in '{input}'"))
                    })?;
                    out.push_str(value);
                    // skip the key and the closing brace
                    for _ in 0..key.chars().count() + 1 {
                        chars.next();
                    }
                }
                _ => out.push(c),
            }
        }
        Ok(out)
    }

    /// Expand every element of `items`
    pub fn expand_all(&self, items: &[String]) -> Result<Vec<String>> {
        items.iter().map(|s| self.expand(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars {
        let mut v = Vars::new();
        v.insert("image", "/tmp/test.sif");
        v.insert("tmpfile", "/tmp/testExec.tmp123");
        v.insert("tmpfile.file_name", "testExec.tmp123");
        v
    }

    #[test]
    fn test_plain_and_substituted() {
        let v = vars();
        assert_eq!(v.expand("true").unwrap(), "true");
        assert_eq!(v.expand("{image}").unwrap(), "/tmp/test.sif");
        assert_eq!(
            v.expand("/home/{tmpfile.file_name}").unwrap(),
            "/home/testExec.tmp123"
        );
        assert_eq!(
            v.expand("{tmpfile}:{image}").unwrap(),
            "/tmp/testExec.tmp123:/tmp/test.sif"
        );
    }

    #[test]
    fn test_escaped_braces() {
        let v = vars();
        assert_eq!(v.expand("{{literal}}").unwrap(), "{literal}");
        assert_eq!(v.expand("a}b").unwrap(), "a}b");
    }

    #[test]
    fn test_unknown_and_unterminated() {
        let v = vars();
        let err = v.expand("{imgae}").unwrap_err();
        assert!(err.to_string().contains("imgae"));
        assert!(v.expand("{image").is_err());
    }

    #[test]
    fn test_non_ascii_passthrough() {
        let v = vars();
        assert_eq!(v.expand("héllo {image} ✓").unwrap(), "héllo /tmp/test.sif ✓");
    }
}
