//! XSD validation of raw DCC XML.
use std::path::Path;

use libxml::{
    error::StructuredError,
    parser::Parser,
    schemas::{SchemaParserContext, SchemaValidationContext},
};
use tracing::{debug, warn};

use crate::{
    config::{Config, SchemaMode},
    constants::DCC_NS,
    fetch::Fetcher,
    tree::Value,
};

pub type ValidationResult = Result<(), Vec<String>>;

/// Where the XSD is read from.
#[derive(Debug, Clone, Copy)]
pub enum XsdSource<'a> {
    File(&'a Path),
    Buffer(&'a [u8]),
}

fn format_validation_errors(errors: Vec<StructuredError>) -> Vec<String> {
    errors
        .iter()
        .map(|se| {
            se.message
                .as_deref()
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|| format!("{se:?}"))
        })
        .collect()
}

fn build_validation_context(xsd: XsdSource<'_>) -> Result<SchemaValidationContext, Vec<String>> {
    let mut parser_ctx = match xsd {
        XsdSource::File(path) => {
            // libxml only reports a generic parse failure for a missing file
            if !path.exists() {
                return Err(vec![format!("Schema not found: {}", path.display())]);
            }
            let xsd_path = path
                .to_str()
                .ok_or_else(|| vec!["Invalid XSD path".to_string()])?;
            SchemaParserContext::from_file(xsd_path)
        }
        XsdSource::Buffer(bytes) => SchemaParserContext::from_buffer(bytes),
    };
    SchemaValidationContext::from_parser(&mut parser_ctx).map_err(format_validation_errors)
}

/// Validate `raw_xml` against `xsd`, collecting every reported problem.
pub fn schema_errors(raw_xml: &[u8], xsd: XsdSource<'_>) -> ValidationResult {
    let mut validation_ctx = build_validation_context(xsd)?;
    let document = Parser::default()
        .parse_string(raw_xml)
        .map_err(|e| vec![format!("Failed to parse XML: {e:?}")])?;
    validation_ctx
        .validate_document(&document)
        .map_err(format_validation_errors)
}

/// Schema URL advertised by the document element's `@schemaLocation`.
///
/// The location paired with the DCC namespace wins; otherwise the first
/// location listed is used.
pub fn schema_location(tree: &Value) -> Option<String> {
    let (_, root) = tree.as_mapping()?.iter().next()?;
    let declared: Vec<&str> = root.attribute("schemaLocation")?.split_whitespace().collect();
    declared
        .chunks_exact(2)
        .find(|pair| pair[0] == DCC_NS)
        .map(|pair| pair[1])
        .or_else(|| match declared.as_slice() {
            [_, url, ..] => Some(*url),
            [url] => Some(*url),
            [] => None,
        })
        .map(str::to_string)
}

/// Validate the document in the requested mode. Never fails: every problem
/// is logged and reported as `false`.
pub fn validate(
    raw_xml: &[u8],
    tree: &Value,
    mode: SchemaMode,
    config: &Config,
    fetcher: &dyn Fetcher,
) -> bool {
    let outcome = match mode {
        SchemaMode::Offline => schema_errors(raw_xml, XsdSource::File(config.schema_path())),
        SchemaMode::Online => {
            let Some(url) = schema_location(tree) else {
                warn!("document declares no schemaLocation");
                return false;
            };
            match fetcher.fetch(&url) {
                Ok(xsd) => schema_errors(raw_xml, XsdSource::Buffer(&xsd)),
                Err(err) => {
                    warn!(%url, error = %err, "could not fetch schema");
                    return false;
                }
            }
        }
    };
    match outcome {
        Ok(()) => {
            debug!(mode = mode.as_str(), "document is schema valid");
            true
        }
        Err(errors) => {
            warn!(mode = mode.as_str(), ?errors, "schema validation failed");
            false
        }
    }
}
