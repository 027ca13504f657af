//! Item key parsing
//!
//! An item key names a metric and optionally carries parameters:
//!
//! ```text
//! system.cpu.load
//! vfs.fs.size[/,pfree]
//! system.run["ls -l /tmp",wait]
//! net.if.in[eth0,]
//! ```
//!
//! Parameters are either unquoted (no `,` or `]`), double quoted (with `\"`
//! escapes) or a nested `[...]` array which is kept verbatim.

use crate::error::TaskError;
use std::fmt;

/// A parsed item key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    raw: String,
    name: String,
    params: Vec<String>,
}

impl ItemKey {
    /// Parse an item key, validating its name and parameter syntax
    pub fn parse(raw: &str) -> Result<Self, TaskError> {
        let raw = raw.trim();
        let invalid = |reason: &str| TaskError::InvalidKey(format!("{}: {}", raw, reason));

        let (name, rest) = match raw.find('[') {
            Some(pos) => (&raw[..pos], Some(&raw[pos + 1..])),
            None => (raw, None),
        };

        if name.is_empty() {
            return Err(invalid("empty key name"));
        }
        if let Some(c) = name.chars().find(|c| !is_key_char(*c)) {
            return Err(invalid(&format!("invalid character '{}' in key name", c)));
        }

        let params = match rest {
            Some(body) => parse_params(body).map_err(|reason| invalid(&reason))?,
            None => Vec::new(),
        };

        Ok(Self {
            raw: raw.to_string(),
            name: name.to_string(),
            params,
        })
    }

    /// The key exactly as requested
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The key name without parameters
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Parameter at `index`, treating a missing or empty parameter as absent
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params
            .get(index)
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Parse everything after the opening bracket
fn parse_params(body: &str) -> Result<Vec<String>, String> {
    let chars: Vec<char> = body.chars().collect();
    let mut params = Vec::new();
    let mut i = 0;

    loop {
        while i < chars.len() && chars[i] == ' ' {
            i += 1;
        }

        let param = match chars.get(i) {
            Some('"') => {
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        Some('\\') if chars.get(i + 1) == Some(&'"') => {
                            value.push('"');
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(c) => {
                            value.push(*c);
                            i += 1;
                        }
                        None => return Err("unterminated quoted parameter".to_string()),
                    }
                }
                while i < chars.len() && chars[i] == ' ' {
                    i += 1;
                }
                value
            }
            Some('[') => {
                let start = i;
                let mut depth = 0usize;
                loop {
                    match chars.get(i) {
                        Some('[') => depth += 1,
                        Some(']') => {
                            depth -= 1;
                            if depth == 0 {
                                i += 1;
                                break;
                            }
                        }
                        Some(_) => {}
                        None => return Err("unterminated array parameter".to_string()),
                    }
                    i += 1;
                }
                chars[start..i].iter().collect()
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != ',' && chars[i] != ']' {
                    i += 1;
                }
                chars[start..i].iter().collect::<String>().trim_end().to_string()
            }
        };
        params.push(param);

        match chars.get(i) {
            Some(',') => i += 1,
            Some(']') => {
                if i + 1 != chars.len() {
                    return Err("unexpected characters after closing bracket".to_string());
                }
                return Ok(params);
            }
            Some(c) => return Err(format!("unexpected character '{}' in parameters", c)),
            None => return Err("missing closing bracket".to_string()),
        }
    }
}
