//! Operation parameters accepted by the document service.

use document_service_query::{
    parse_fields, parse_filters, parse_populate, parse_sort, FilterNode, Populate, SortField,
};
use serde_json::{Map, Value};

use crate::document::{LocaleParam, Status, ValidationError};

/// Parameters of one document service call.
///
/// Built with the setters below or parsed from the loosely-shaped JSON object the
/// HTTP layer forwards (`{"locale": "en", "filters": {...}, "populate": "*"}`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentParams {
    pub locale: Option<LocaleParam>,
    pub status: Option<Status>,
    pub data: Option<Map<String, Value>>,
    pub fields: Option<Vec<String>>,
    pub filters: Option<FilterNode>,
    pub populate: Populate,
    pub sort: Vec<SortField>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub start: Option<u64>,
    pub limit: Option<u64>,
    /// Recorded in `createdBy` / `updatedBy`.
    pub actor: Option<String>,
}

fn invalid(key: &str, expected: &str, value: &Value) -> ValidationError {
    ValidationError::InvalidParams(format!("`{key}` must be {expected}, got {value}"))
}

fn parse_count(key: &str, value: &Value) -> Result<Option<u64>, ValidationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(key, "a non-negative integer", value)),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| invalid(key, "a non-negative integer", value)),
        other => Err(invalid(key, "a non-negative integer", other)),
    }
}

impl DocumentParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => return Err(invalid("params", "an object", other)),
        };

        let mut params = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "locale" if !value.is_null() => params.locale = Some(LocaleParam::parse(value)?),
                "status" => {
                    params.status = match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.parse()?),
                        other => return Err(ValidationError::InvalidStatus(other.to_string())),
                    }
                }
                "data" => {
                    params.data = match value {
                        Value::Null => None,
                        Value::Object(data) => Some(data.clone()),
                        other => return Err(invalid(key, "an object", other)),
                    }
                }
                "fields" if !value.is_null() => params.fields = Some(parse_fields(value)?),
                "filters" if !value.is_null() => params.filters = Some(parse_filters(value)?),
                "populate" => params.populate = parse_populate(value)?,
                "sort" if !value.is_null() => params.sort = parse_sort(value)?,
                "page" => params.page = parse_count(key, value)?,
                "pageSize" => params.page_size = parse_count(key, value)?,
                "start" => params.start = parse_count(key, value)?,
                "limit" => params.limit = parse_count(key, value)?,
                "actor" => {
                    params.actor = match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => return Err(invalid(key, "a string", other)),
                    }
                }
                "locale" | "fields" | "filters" | "sort" => {}
                other => tracing::debug!(param = other, "ignoring unknown document parameter"),
            }
        }
        Ok(params)
    }

    pub fn locale(mut self, locale: impl Into<LocaleParam>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Non-object values leave `data` unset.
    pub fn data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn filters(mut self, filters: FilterNode) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn populate(mut self, populate: Populate) -> Self {
        self.populate = populate;
        self
    }

    pub fn sort(mut self, sort: Vec<SortField>) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, page: u64, page_size: u64) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// The single locale addressed, if any.
    pub fn single_locale(&self) -> Option<&str> {
        self.locale.as_ref().and_then(LocaleParam::single)
    }
}
