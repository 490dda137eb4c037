//! Forwarding tag derivation.
//!
//! A tag is `prefix.suffix`, where the suffix comes from a configured
//! container label and falls back to a value derived from the container's
//! name and hostname.

use crate::record::LogRecord;

pub const TAG_SEPARATOR: char = '.';

/// Which container metadata is used when the suffix label is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuffixFallback {
    #[default]
    Name,
    NameAndHostname,
    Hostname,
}

impl std::str::FromStr for SuffixFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "name-hostname" | "name_hostname" => Ok(Self::NameAndHostname),
            "hostname" => Ok(Self::Hostname),
            other => Err(format!("unknown tag suffix fallback '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagConfig {
    pub prefix: String,
    pub suffix_label: String,
    pub fallback: SuffixFallback,
    /// Legacy behavior: append the separator even when the suffix is empty.
    pub always_append_suffix: bool,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            prefix: "docker".to_string(),
            suffix_label: String::new(),
            fallback: SuffixFallback::Name,
            always_append_suffix: false,
        }
    }
}

impl TagConfig {
    pub fn tag_for(&self, record: &LogRecord) -> String {
        let label_value = record.label(&self.suffix_label).unwrap_or_default();
        let fallback = self.fallback_suffix(record);
        if self.always_append_suffix {
            let suffix = if label_value.is_empty() {
                fallback.as_str()
            } else {
                label_value
            };
            return format!("{}{TAG_SEPARATOR}{suffix}", self.prefix);
        }
        derive_tag(&self.prefix, label_value, &fallback)
    }

    fn fallback_suffix(&self, record: &LogRecord) -> String {
        // Docker reports names as "/name".
        let name = record.container.name.trim_start_matches('/');
        let hostname = record.container.hostname.as_str();
        match self.fallback {
            SuffixFallback::Name => name.to_string(),
            SuffixFallback::Hostname => hostname.to_string(),
            SuffixFallback::NameAndHostname => match (name.is_empty(), hostname.is_empty()) {
                (false, false) => format!("{name}-{hostname}"),
                (false, true) => name.to_string(),
                (true, _) => hostname.to_string(),
            },
        }
    }
}

pub fn derive_tag(prefix: &str, suffix_label_value: &str, fallback_suffix: &str) -> String {
    let suffix = if suffix_label_value.is_empty() {
        fallback_suffix
    } else {
        suffix_label_value
    };

    let mut tag = String::with_capacity(prefix.len() + suffix.len() + 1);
    tag.push_str(prefix);
    if !suffix.is_empty() {
        if !tag.is_empty() {
            tag.push(TAG_SEPARATOR);
        }
        tag.push_str(suffix);
    }
    tag
}
