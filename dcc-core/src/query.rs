//! `refType`-keyed search and extraction over the generic tree.
//!
//! Every search is depth-first and pre-order; mapping entries are visited in
//! document order and the first match wins.
use crate::tree::{Mapping, Value};
use serde::Serialize;
use std::{ops::ControlFlow, str::FromStr};
use thiserror::Error;

/// Visit `node` and all of its descendants in pre-order.
///
/// `key` is the mapping key the node is stored under; items of a sequence
/// are reported with the key of the sequence itself.
pub fn walk<'a, B>(
    node: &'a Value,
    key: Option<&'a str>,
    visit: &mut impl FnMut(Option<&'a str>, &'a Value) -> ControlFlow<B>,
) -> ControlFlow<B> {
    visit(key, node)?;
    match node {
        Value::Mapping(mapping) => {
            for (k, child) in mapping.iter() {
                walk(child, Some(k), visit)?;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                walk(item, key, visit)?;
            }
        }
        Value::Scalar(_) => {}
    }
    ControlFlow::Continue(())
}

fn find_first<'a>(
    tree: &'a Value,
    mut accept: impl FnMut(Option<&str>, &Value) -> bool,
) -> Option<&'a Value> {
    match walk(tree, None, &mut |key, node| {
        if accept(key, node) {
            ControlFlow::Break(node)
        } else {
            ControlFlow::Continue(())
        }
    }) {
        ControlFlow::Break(found) => Some(found),
        ControlFlow::Continue(()) => None,
    }
}

/// First node anywhere in `tree` whose `@refType` equals `ref_type`.
pub fn find_by_ref_type<'a>(tree: &'a Value, ref_type: &str) -> Option<&'a Value> {
    find_first(tree, |_, node| node.attribute("refType") == Some(ref_type))
}

/// Like [`find_by_ref_type`] but only considers elements named `tag`.
pub fn find_element_by_ref_type<'a>(
    tree: &'a Value,
    tag: &str,
    ref_type: &str,
) -> Option<&'a Value> {
    find_first(tree, |key, node| {
        key == Some(tag) && node.attribute("refType") == Some(ref_type)
    })
}

/// Value of a `valueXMLList`: a number when the text parses as one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Number(f64),
    Text(String),
}

impl Reading {
    fn parse(raw: &str) -> Self {
        raw.trim()
            .parse::<f64>()
            .map(Reading::Number)
            .unwrap_or_else(|_| Reading::Text(raw.to_string()))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Number(n) => Some(*n),
            Reading::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantityReading {
    pub value: Reading,
    pub unit: String,
}

/// Collect `refType → (value, unit)` for the quantities of the list whose
/// `@refType` is `list_ref_type`.
///
/// Quantities without a `@refType` or without a `realListXMLList` payload
/// are skipped. The result keeps document order; a repeated `refType`
/// keeps its first position and the last reading.
pub fn collect_quantities_under(
    tree: &Value,
    list_ref_type: &str,
) -> Vec<(String, QuantityReading)> {
    let mut found: Vec<(String, QuantityReading)> = Vec::new();
    let Some(list) = find_by_ref_type(tree, list_ref_type) else {
        return found;
    };
    let quantities = list.get("quantity").map(Value::items).unwrap_or_default();
    for quantity in quantities {
        let Some(ref_type) = quantity.attribute("refType") else {
            continue;
        };
        let Some(payload) = quantity.get("realListXMLList") else {
            continue;
        };
        let (Some(value), Some(unit)) = (
            payload.get("valueXMLList").and_then(Value::as_str),
            payload.get("unitXMLList").and_then(Value::as_str),
        ) else {
            continue;
        };
        let reading = QuantityReading {
            value: Reading::parse(value),
            unit: unit.to_string(),
        };
        match found.iter_mut().find(|(k, _)| k == ref_type) {
            Some((_, slot)) => *slot = reading,
            None => found.push((ref_type.to_string(), reading)),
        }
    }
    found
}

/// How calibration results are labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultLabel {
    /// Concatenated human readable names of the enclosing nodes.
    Name,
    /// XPath-like locator built from tag names and `refType` values.
    XPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResultLabelParseError {
    #[error("invalid result label mode: {input}")]
    Invalid { input: String },
}

impl FromStr for ResultLabel {
    type Err = ResultLabelParseError;
    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode.to_ascii_lowercase().as_str() {
            "name" => Ok(ResultLabel::Name),
            "xpath" => Ok(ResultLabel::XPath),
            _ => Err(ResultLabelParseError::Invalid {
                input: mode.to_string(),
            }),
        }
    }
}

/// Text of a `name`/`description`-like node: the `content` in `lang` when
/// there is one, otherwise the first `content`.
pub fn localized_text<'a>(node: &'a Value, lang: Option<&str>) -> Option<&'a str> {
    let contents = node.get("content")?.items();
    let preferred = lang.and_then(|lang| {
        contents
            .iter()
            .find(|c| c.attribute("lang") == Some(lang))
    });
    preferred.or_else(|| contents.first())?.text()
}

struct ResultWalker<'a> {
    label: ResultLabel,
    lang: Option<&'a str>,
    path: Vec<String>,
    out: Vec<(String, Value)>,
}

impl ResultWalker<'_> {
    fn segment(&self, tag: &str, node: &Value) -> String {
        match self.label {
            ResultLabel::XPath => match node.attribute("refType") {
                Some(ref_type) => format!("//dcc:{tag} [ @ refType ='{ref_type}']"),
                None => format!("//dcc:{tag}"),
            },
            ResultLabel::Name => node
                .get("name")
                .and_then(|name| localized_text(name, self.lang))
                .map(|text| format!(" {text}"))
                .unwrap_or_default(),
        }
    }

    fn label(&self) -> String {
        match self.label {
            ResultLabel::XPath => format!(".{}", self.path.join(" ")),
            ResultLabel::Name => self.path.concat(),
        }
    }

    fn descend(&mut self, tag: &str, node: &Value, inner: impl FnOnce(&mut Self)) {
        let segment = self.segment(tag, node);
        self.path.push(segment);
        inner(self);
        self.path.pop();
    }

    fn measurement_results(&mut self, dcc: &Value) {
        let Some(results) = dcc.get("measurementResults") else {
            return;
        };
        for measurement in results.get("measurementResult").map(Value::items).unwrap_or_default() {
            self.descend("measurementResult", measurement, |w| {
                let Some(results) = measurement.get("results") else {
                    return;
                };
                for result in results.get("result").map(Value::items).unwrap_or_default() {
                    w.descend("result", result, |w| {
                        if let Some(data) = result.get("data") {
                            w.data(data);
                        }
                    });
                }
            });
        }
    }

    fn data(&mut self, container: &Value) {
        let Some(mapping) = container.as_mapping() else {
            return;
        };
        for (key, child) in mapping.iter() {
            match key {
                "list" => {
                    for list in child.items() {
                        self.descend("list", list, |w| w.data(list));
                    }
                }
                "quantity" => {
                    for quantity in child.items() {
                        self.descend("quantity", quantity, |w| {
                            let label = w.label();
                            w.out.push((label, result_payload(quantity)));
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

fn result_payload(quantity: &Value) -> Value {
    match quantity {
        Value::Mapping(m) => Value::Mapping(m.filtered(|k| k != "name" && !k.starts_with('@'))),
        other => other.clone(),
    }
}

/// Every result quantity under `measurementResults`, labelled per `label`.
///
/// `dcc` is the document element (`digitalCalibrationCertificate`), `lang`
/// selects which localized name is used in [`ResultLabel::Name`] mode.
pub fn calibration_results(
    dcc: &Value,
    label: ResultLabel,
    lang: Option<&str>,
) -> Vec<(String, Value)> {
    let mut walker = ResultWalker {
        label,
        lang,
        path: Vec::new(),
        out: Vec::new(),
    };
    walker.measurement_results(dcc);
    walker.out
}

/// Wrap `value` in a single-entry mapping keyed by `tag`.
pub(crate) fn tagged(tag: &str, value: &Value) -> Value {
    let mut mapping = Mapping::new();
    mapping.insert(tag, value.clone());
    Value::Mapping(mapping)
}
