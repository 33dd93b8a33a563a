//! Document identity utilities.
//!
//! One logical document is addressed by its `documentId`; a concrete version of it
//! additionally needs a locale and a status:
//! - Draft: `publishedAt` is null
//! - Published: `publishedAt` is set

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::validate::ValidationError;

const DOCUMENT_ID_LEN: usize = 24;
const ALL_LOCALES: &str = "*";

/// Generate a new document id: 24 lowercase alphanumerics, starting with a letter.
pub fn generate_document_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    // First character must not be a digit so ids never look numeric.
    let first = (b'a' + (u8::from_str_radix(&hex[..2], 16).unwrap_or(0) % 26)) as char;
    let mut id = String::with_capacity(DOCUMENT_ID_LEN);
    id.push(first);
    id.push_str(&hex[2..DOCUMENT_ID_LEN + 1]);
    id
}

/// Publication status of one version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Draft,
    Published,
}

impl Status {
    pub fn is_draft(self) -> bool {
        self == Status::Draft
    }

    pub fn opposite(self) -> Self {
        match self {
            Status::Draft => Status::Published,
            Status::Published => Status::Draft,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::Published => "published",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Status::Draft),
            "published" => Ok(Status::Published),
            other => Err(ValidationError::InvalidStatus(other.to_string())),
        }
    }
}

/// Derived status of a document version, taking its sibling into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Published,
    Modified,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Published => "published",
            DocumentStatus::Modified => "modified",
        }
    }
}

/// `locale` parameter: one locale, several, or `*` for all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum LocaleParam {
    All,
    One(String),
    Many(Vec<String>),
}

impl LocaleParam {
    pub fn parse(value: &Value) -> Result<Self, ValidationError> {
        match value {
            Value::String(s) if s == ALL_LOCALES => Ok(LocaleParam::All),
            Value::String(s) => Ok(LocaleParam::One(validate_locale(s)?)),
            Value::Array(items) => {
                let locales = items
                    .iter()
                    .map(|item| match item.as_str() {
                        Some(ALL_LOCALES) => Err(ValidationError::InvalidLocale(
                            "`*` cannot be combined with other locales".into(),
                        )),
                        Some(s) => validate_locale(s),
                        None => Err(ValidationError::InvalidLocale(item.to_string())),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(LocaleParam::Many(locales))
            }
            other => Err(ValidationError::InvalidLocale(other.to_string())),
        }
    }

    /// The single locale this parameter designates, if any.
    pub fn single(&self) -> Option<&str> {
        match self {
            LocaleParam::One(locale) => Some(locale),
            LocaleParam::Many(locales) if locales.len() == 1 => Some(&locales[0]),
            _ => None,
        }
    }
}

impl From<&str> for LocaleParam {
    fn from(locale: &str) -> Self {
        if locale == ALL_LOCALES {
            LocaleParam::All
        } else {
            LocaleParam::One(locale.to_string())
        }
    }
}

impl TryFrom<Value> for LocaleParam {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        LocaleParam::parse(&value)
    }
}

impl From<LocaleParam> for Value {
    fn from(param: LocaleParam) -> Self {
        match param {
            LocaleParam::All => Value::String(ALL_LOCALES.into()),
            LocaleParam::One(locale) => Value::String(locale),
            LocaleParam::Many(locales) => {
                Value::Array(locales.into_iter().map(Value::String).collect())
            }
        }
    }
}

fn validate_locale(locale: &str) -> Result<String, ValidationError> {
    let valid = !locale.is_empty()
        && locale.len() <= 32
        && locale
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(locale.to_string())
    } else {
        Err(ValidationError::InvalidLocale(locale.to_string()))
    }
}

/// Address of one version: `(documentId, locale, status)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionKey {
    pub document_id: String,
    pub locale: Option<String>,
    pub status: Status,
}

impl VersionKey {
    pub fn new(document_id: impl Into<String>, locale: Option<String>, status: Status) -> Self {
        Self {
            document_id: document_id.into(),
            locale,
            status,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{}@{}#{}", self.document_id, locale, self.status),
            None => write!(f, "{}#{}", self.document_id, self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_are_unique_and_well_formed() {
        let a = generate_document_id();
        let b = generate_document_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), DOCUMENT_ID_LEN);
        assert!(a.chars().next().unwrap().is_ascii_lowercase());
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn parse_status() {
        assert_eq!("draft".parse::<Status>().unwrap(), Status::Draft);
        assert_eq!("published".parse::<Status>().unwrap(), Status::Published);
        assert!("archived".parse::<Status>().is_err());
        assert_eq!(Status::Draft.opposite(), Status::Published);
    }

    #[test]
    fn parse_locale_param() {
        assert_eq!(LocaleParam::parse(&json!("*")).unwrap(), LocaleParam::All);
        assert_eq!(LocaleParam::parse(&json!("en")).unwrap(), LocaleParam::One("en".into()));
        assert_eq!(
            LocaleParam::parse(&json!(["en", "it"])).unwrap(),
            LocaleParam::Many(vec!["en".into(), "it".into()])
        );
        assert!(LocaleParam::parse(&json!(["en", "*"])).is_err());
        assert!(LocaleParam::parse(&json!("en us")).is_err());
        assert!(LocaleParam::parse(&json!(3)).is_err());
    }

    #[test]
    fn version_key_display() {
        let key = VersionKey::new("Article1", Some("en".into()), Status::Published);
        assert_eq!(key.to_string(), "Article1@en#published");
        let key = VersionKey::new("Tag1", None, Status::Draft);
        assert_eq!(key.to_string(), "Tag1#draft");
    }
}
