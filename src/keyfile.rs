//! Minimal INI ("keyfile") documents: `[section]` headers and `key = value`
//! lines, order preserved.

use std::fmt;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("Line {line}: key outside of any section")]
    KeyOutsideSection { line: usize },

    #[error("Line {line}: cannot parse '{text}'")]
    Malformed { line: usize, text: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    sections: Vec<Section>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// ```
    /// use labfeed_rs::keyfile::KeyFile;
    ///
    /// let doc = KeyFile::parse("[global]\nsigrok version = 0.6.0\n").unwrap();
    /// assert_eq!(doc.get("global", "sigrok version"), Some("0.6.0"));
    /// ```
    pub fn parse(text: &str) -> Result<Self, KeyFileError> {
        let mut doc = Self::new();
        let mut current: Option<usize> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| KeyFileError::Malformed {
                    line: number + 1,
                    text: raw.to_string(),
                })?;
                current = Some(doc.section_index_or_insert(name.trim()));
            } else if let Some((key, value)) = line.split_once('=') {
                let index = current.ok_or(KeyFileError::KeyOutsideSection { line: number + 1 })?;
                set_entry(&mut doc.sections[index], key.trim(), value.trim());
            } else {
                return Err(KeyFileError::Malformed {
                    line: number + 1,
                    text: raw.to_string(),
                });
            }
        }
        Ok(doc)
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(index) = self.sections.iter().position(|s| s.name == name) {
            return index;
        }
        self.sections.push(Section {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.sections.len() - 1
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.section(name).is_some()
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// Keys and values of `section`, in file order.
    pub fn entries(&self, section: &str) -> impl Iterator<Item = (&str, &str)> {
        self.section(section)
            .into_iter()
            .flat_map(|s| s.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, section: &str, key: &str) -> Option<T> {
        self.get(section, key)?.parse().ok()
    }

    /// Insert or replace `key` in `section`, creating the section if needed.
    pub fn set(&mut self, section: &str, key: &str, value: impl fmt::Display) {
        let index = self.section_index_or_insert(section);
        set_entry(&mut self.sections[index], key, &value.to_string());
    }
}

fn set_entry(section: &mut Section, key: &str, value: &str) {
    if let Some(entry) = section.entries.iter_mut().find(|(k, _)| k == key) {
        entry.1 = value.to_string();
    } else {
        section.entries.push((key.to_string(), value.to_string()));
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}
