//! View query parameters and result rows
//!
//! The view engine itself lives outside the node; this module fixes the
//! shape of its inputs (form parameters bound to [`ViewParams`]) and of its
//! output rows, including the JSON collation order rows are sorted by.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Source of form parameter values
pub trait Form {
    /// Value of `name`, or `None`/empty when unset
    fn form_value(&self, name: &str) -> Option<&str>;
}

impl Form for HashMap<String, String> {
    fn form_value(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl Form for BTreeMap<String, String> {
    fn form_value(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl Form for [(&str, &str)] {
    fn form_value(&self, name: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
    }
}

/// Query parameters accepted by a view request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewParams {
    pub key: String,
    pub keys: String,
    #[serde(rename = "startkey")]
    pub start_key: Value,
    #[serde(rename = "startkey_docid")]
    pub start_key_doc_id: String,
    #[serde(rename = "endkey")]
    pub end_key: Value,
    #[serde(rename = "endkey_docid")]
    pub end_key_doc_id: String,
    pub stale: String,
    pub descending: bool,
    pub group: bool,
    pub group_level: u64,
    pub include_docs: bool,
    pub inclusive_end: bool,
    pub limit: u64,
    pub reduce: bool,
    pub skip: u64,
    pub update_seq: bool,
}

impl Default for ViewParams {
    fn default() -> Self {
        Self {
            key: String::new(),
            keys: String::new(),
            start_key: Value::Null,
            start_key_doc_id: String::new(),
            end_key: Value::Null,
            end_key_doc_id: String::new(),
            stale: String::new(),
            descending: false,
            group: false,
            group_level: 0,
            include_docs: false,
            inclusive_end: true,
            limit: 0,
            reduce: true,
            skip: 0,
            update_seq: false,
        }
    }
}

/// How a form value is coerced before it is stored
enum Setter {
    Str(fn(&mut ViewParams, String)),
    Uint(fn(&mut ViewParams, u64)),
    Bool(fn(&mut ViewParams, bool)),
    Json(fn(&mut ViewParams, Value)),
}

static FIELDS: &[(&str, Setter)] = &[
    ("key", Setter::Str(|p: &mut ViewParams, v| p.key = v)),
    ("keys", Setter::Str(|p: &mut ViewParams, v| p.keys = v)),
    ("startkey", Setter::Json(|p: &mut ViewParams, v| p.start_key = v)),
    (
        "startkey_docid",
        Setter::Str(|p: &mut ViewParams, v| p.start_key_doc_id = v),
    ),
    ("endkey", Setter::Json(|p: &mut ViewParams, v| p.end_key = v)),
    (
        "endkey_docid",
        Setter::Str(|p: &mut ViewParams, v| p.end_key_doc_id = v),
    ),
    ("stale", Setter::Str(|p: &mut ViewParams, v| p.stale = v)),
    ("descending", Setter::Bool(|p: &mut ViewParams, v| p.descending = v)),
    ("group", Setter::Bool(|p: &mut ViewParams, v| p.group = v)),
    ("group_level", Setter::Uint(|p: &mut ViewParams, v| p.group_level = v)),
    ("include_docs", Setter::Bool(|p: &mut ViewParams, v| p.include_docs = v)),
    ("inclusive_end", Setter::Bool(|p: &mut ViewParams, v| p.inclusive_end = v)),
    ("limit", Setter::Uint(|p: &mut ViewParams, v| p.limit = v)),
    ("reduce", Setter::Bool(|p: &mut ViewParams, v| p.reduce = v)),
    ("skip", Setter::Uint(|p: &mut ViewParams, v| p.skip = v)),
    ("update_seq", Setter::Bool(|p: &mut ViewParams, v| p.update_seq = v)),
];

impl ViewParams {
    /// Bind form parameters onto a fresh set of defaults
    ///
    /// Unset or empty parameters keep their defaults. Booleans are true only
    /// for the literal `true`; a value that does not parse for its field's
    /// type rejects the whole request.
    pub fn parse<F: Form + ?Sized>(form: Option<&F>) -> Result<Self> {
        let mut params = Self::default();
        let Some(form) = form else {
            return Ok(params);
        };

        for (name, setter) in FIELDS {
            let name: &'static str = name;
            let raw = match form.form_value(name) {
                Some(raw) if !raw.is_empty() => raw,
                _ => continue,
            };
            match setter {
                Setter::Str(set) => set(&mut params, raw.to_string()),
                Setter::Uint(set) => {
                    let v = raw.parse::<u64>().map_err(|e| Error::InvalidParameter {
                        name,
                        reason: e.to_string(),
                    })?;
                    set(&mut params, v);
                }
                Setter::Bool(set) => set(&mut params, raw == "true"),
                Setter::Json(set) => {
                    let v = serde_json::from_str(raw).map_err(|e| Error::InvalidParameter {
                        name,
                        reason: e.to_string(),
                    })?;
                    set(&mut params, v);
                }
            }
        }

        Ok(params)
    }
}

/// One row of a view result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewRow {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub key: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewResult {
    pub total_rows: usize,
    pub rows: Vec<ViewRow>,
}

/// Sort rows by their keys in JSON collation order
pub fn sort_rows(rows: &mut [ViewRow]) {
    rows.sort_by(|a, b| collate_json(&a.key, &b.key));
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order over JSON values used for view keys
///
/// null < false < true < numbers < strings < arrays < objects. Arrays compare
/// element-wise and then by length; objects compare entry by entry (key then
/// value) and then by size.
pub fn collate_json(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let c = collate_json(l, r);
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let c = lk.cmp(rk).then_with(|| collate_json(lv, rv));
                if c != Ordering::Equal {
                    return c;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}
