//! Query string parameters recognized on fetch requests.

use super::{
    error::Error,
    filter::{FilterError, FilterNode},
    page::{PageRequest, PaginationError},
    sort::SortRequest,
};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};
use url::form_urlencoded;

/// The parsed query parameters of a request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryParams {
    /// `filter[objects]`: filters to combine conjunctively.
    pub filters: Vec<FilterNode>,
    pub sort: SortRequest,
    pub page_size: Option<i64>,
    pub page_number: Option<i64>,
    /// `include`, if the client gave one, even an empty one.
    pub include: Option<Vec<String>>,
    /// `fields[TYPE]`: sparse fieldsets by type.
    pub fields: HashMap<String, HashSet<String>>,
}

impl QueryParams {
    /// Parse a URL-encoded query string (without the leading `?`).
    ///
    /// Unrecognized parameters are ignored.
    pub fn parse(query: &str) -> Result<Self, Error> {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "filter[objects]" => params.filters = parse_filters(&value)?,
                "sort" => params.sort = value.parse()?,
                "page[size]" => params.page_size = Some(parse_int("page[size]", &value)?),
                "page[number]" => params.page_number = Some(parse_int("page[number]", &value)?),
                "include" => params.include = Some(split_list(&value).collect()),
                key => {
                    if let Some(ty) = key
                        .strip_prefix("fields[")
                        .and_then(|key| key.strip_suffix(']'))
                    {
                        params
                            .fields
                            .insert(ty.to_string(), split_list(&value).collect());
                    }
                }
            }
        }
        Ok(params)
    }

    /// The page requested, using defaults for parameters the client left out.
    pub fn page(
        &self,
        default_size: usize,
        max_size: usize,
    ) -> Result<PageRequest, PaginationError> {
        let size = self
            .page_size
            .unwrap_or_else(|| i64::try_from(default_size).unwrap_or(i64::MAX));
        PageRequest::new(size, self.page_number.unwrap_or(1), max_size)
    }
}

fn parse_filters(value: &str) -> Result<Vec<FilterNode>, Error> {
    let json: Json = serde_json::from_str(value)
        .map_err(|_| Error::bad_request("Unable to decode filter objects as JSON list"))?;
    let Json::Array(filters) = json else {
        return Err(Error::bad_request(
            "Unable to decode filter objects as JSON list",
        ));
    };
    Ok(filters
        .iter()
        .map(FilterNode::parse)
        .collect::<Result<_, FilterError>>()?)
}

fn parse_int(param: &str, value: &str) -> Result<i64, PaginationError> {
    value
        .trim()
        .parse()
        .map_err(|_| PaginationError::NotAnInteger {
            param: param.into(),
            value: value.into(),
        })
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
}
