//! Loading a DCC and reading it.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    Error,
    compression::{Bzip2Codec, Codec, CodecError, CompressedDcc},
    config::{Config, SchemaMode},
    fetch::{FetchError, Fetcher, HttpFetcher},
    query::{ResultLabel, calibration_results, find_element_by_ref_type, localized_text, tagged},
    schema,
    signature::{self, SignatureError, SignatureRecord},
    status::{CheckState, StatusKind, StatusReport},
    tree::{TreeError, Value, parse_tree},
    trust::{ParsedCertificate, TrustStore},
};

/// Why a document could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch DCC: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to decompress DCC: {0}")]
    Decompress(#[from] CodecError),
    #[error("failed to parse DCC: {0}")]
    Parse(#[from] TreeError),
}

#[derive(Debug)]
enum Source {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Compressed(Vec<u8>),
    Url(String),
}

impl Source {
    fn kind(&self) -> &'static str {
        match self {
            Source::Path(_) => "path",
            Source::Bytes(_) => "bytes",
            Source::Compressed(_) => "compressed",
            Source::Url(_) => "url",
        }
    }
}

/// Options for [`Dcc`] loading. Exactly one source must be given.
///
/// # Examples
/// ```rust,no_run
/// use std::sync::Arc;
/// use dcc_core::{Dcc, trust::TrustStore};
///
/// let mut store = TrustStore::new();
/// store.load_trusted_root_from_file("certs/root.pem")?;
/// store.load_intermediate_from_file("certs/sub.pem")?;
///
/// let dcc = Dcc::builder()
///     .path("dcc_signed.xml")
///     .trust_store(Arc::new(store))
///     .load()?;
/// assert_eq!(dcc.status_report().valid_signature(), Some(true));
/// # Ok::<(), dcc_core::Error>(())
/// ```
#[derive(Debug)]
pub struct DccBuilder {
    source: Option<Source>,
    trust_store: Option<Arc<TrustStore>>,
    signature_verification: bool,
    fetcher: Option<Arc<dyn Fetcher>>,
    codec: Option<Arc<dyn Codec>>,
    config: Option<Config>,
}

impl Default for DccBuilder {
    fn default() -> Self {
        Self {
            source: None,
            trust_store: None,
            signature_verification: true,
            fetcher: None,
            codec: None,
            config: None,
        }
    }
}

impl DccBuilder {
    fn source(mut self, source: Source) -> Self {
        assert!(
            self.source.is_none(),
            "a DCC source was already set; pass exactly one of path, bytes, compressed or url"
        );
        self.source = Some(source);
        self
    }

    pub fn path(self, path: impl Into<PathBuf>) -> Self {
        self.source(Source::Path(path.into()))
    }

    pub fn bytes(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.source(Source::Bytes(bytes.into()))
    }

    /// Bytes produced by [`Dcc::generate_compressed_dcc`].
    pub fn compressed(self, bytes: impl Into<Vec<u8>>) -> Self {
        self.source(Source::Compressed(bytes.into()))
    }

    pub fn url(self, url: impl Into<String>) -> Self {
        self.source(Source::Url(url.into()))
    }

    /// Verify the embedded signature against `store` while loading.
    pub fn trust_store(mut self, store: Arc<TrustStore>) -> Self {
        self.trust_store = Some(store);
        self
    }

    /// Skip signature verification even when a trust store is set.
    pub fn signature_verification(mut self, enabled: bool) -> Self {
        self.signature_verification = enabled;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Read, parse and (optionally) verify the document.
    ///
    /// # Panics
    /// When no source was given.
    ///
    /// # Errors
    /// [`Error::Load`] when the source cannot be read, fetched, decompressed
    /// or parsed; [`Error::Signature`] when a requested signature
    /// verification fails.
    pub fn load(self) -> Result<Dcc, Error> {
        let Some(source) = self.source else {
            panic!("Dcc::builder() needs a source: path, bytes, compressed or url");
        };
        load(
            source,
            self.config.unwrap_or_default(),
            self.fetcher,
            self.codec.unwrap_or_else(|| Arc::new(Bzip2Codec)),
            self.trust_store.filter(|_| self.signature_verification),
        )
    }
}

#[instrument(skip_all, fields(source = source.kind()))]
fn load(
    source: Source,
    config: Config,
    fetcher: Option<Arc<dyn Fetcher>>,
    codec: Arc<dyn Codec>,
    trust_store: Option<Arc<TrustStore>>,
) -> Result<Dcc, Error> {
    let raw = match source {
        Source::Path(path) => fs::read(&path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?,
        Source::Bytes(bytes) => bytes,
        Source::Compressed(bytes) => codec.decompress(&bytes).map_err(LoadError::Decompress)?,
        Source::Url(url) => resolve_fetcher(&fetcher, &config)
            .and_then(|fetcher| fetcher.fetch(&url))
            .map_err(LoadError::Fetch)?,
    };
    let tree = parse_tree(&raw).map_err(LoadError::Parse)?;

    let mut status = StatusReport::new();
    status.set(StatusKind::IsLoaded, CheckState::Pass);
    let signed = signature::is_signed(&tree);
    if signed {
        status.set(StatusKind::IsSigned, CheckState::Pass);
    } else {
        status.fail(StatusKind::IsSigned, "document has no ds:Signature");
    }

    let mut dcc = Dcc {
        raw,
        tree,
        status,
        signature: None,
        config,
        fetcher,
        codec,
    };
    if let Some(store) = trust_store {
        dcc.verify_signature(&store)?;
    }
    info!(
        uid = dcc.uid().unwrap_or_default(),
        signed,
        verified = ?dcc.status.valid_signature(),
        "DCC loaded"
    );
    Ok(dcc)
}

fn resolve_fetcher(
    fetcher: &Option<Arc<dyn Fetcher>>,
    config: &Config,
) -> Result<Arc<dyn Fetcher>, FetchError> {
    match fetcher {
        Some(fetcher) => Ok(Arc::clone(fetcher)),
        None => Ok(Arc::new(HttpFetcher::new(config)?)),
    }
}

/// A loaded Digital Calibration Certificate.
#[derive(Debug)]
pub struct Dcc {
    raw: Vec<u8>,
    tree: Value,
    status: StatusReport,
    signature: Option<SignatureRecord>,
    config: Config,
    fetcher: Option<Arc<dyn Fetcher>>,
    codec: Arc<dyn Codec>,
}

impl Dcc {
    pub fn builder() -> DccBuilder {
        DccBuilder::default()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::builder().path(path.as_ref()).load()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        Self::builder().bytes(bytes).load()
    }

    pub fn from_compressed(bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        Self::builder().compressed(bytes).load()
    }

    pub fn is_loaded(&self) -> bool {
        self.status.is_loaded()
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The whole tree, keyed by the document element's name.
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    pub fn status_report(&self) -> &StatusReport {
        &self.status
    }

    fn document_element(&self) -> &Value {
        self.tree
            .as_mapping()
            .and_then(|root| root.iter().next())
            .map_or(&self.tree, |(_, element)| element)
    }

    fn core_data(&self, key: &str) -> Option<&str> {
        self.document_element()
            .path(&["administrativeData", "coreData", key])?
            .text()
            .map(str::trim)
    }

    pub fn uid(&self) -> Option<&str> {
        self.core_data("uniqueIdentifier")
    }

    /// DCC schema version declared on the document element.
    pub fn version(&self) -> Option<&str> {
        self.document_element().attribute("schemaVersion")
    }

    pub fn mandatory_language(&self) -> Option<&str> {
        self.core_data("mandatoryLangCodeISO639_1")
    }

    /// Start of the calibration (`beginPerformanceDate`) at midnight.
    pub fn calibration_date(&self) -> Option<NaiveDateTime> {
        let date = self.core_data("beginPerformanceDate")?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .ok()?
            .and_hms_opt(0, 0, 0)
    }

    pub fn days_since_calibration(&self) -> Option<i64> {
        let since = Utc::now().naive_utc() - self.calibration_date()?;
        Some(since.num_days())
    }

    pub fn calibration_laboratory_name(&self) -> Option<&str> {
        let name = self.document_element().path(&[
            "administrativeData",
            "calibrationLaboratory",
            "contact",
            "name",
        ])?;
        localized_text(name, None)
    }

    /// Identifications of the first calibrated item, as
    /// `{identifications: …}`.
    pub fn item_id(&self) -> Option<Value> {
        self.document_element()
            .path(&["administrativeData", "items", "item", "identifications"])
            .map(|ids| tagged("identifications", ids))
    }

    /// Value of the first identification whose name matches `name`.
    ///
    /// `lang` restricts which localized name is compared, `issuer` which
    /// identification issuer is accepted.
    pub fn get_item_id_by_name(
        &self,
        name: &str,
        lang: Option<&str>,
        issuer: Option<&str>,
    ) -> Option<String> {
        let items = self
            .document_element()
            .path(&["administrativeData", "items"])?
            .get("item")?;
        items
            .items()
            .iter()
            .filter_map(|item| item.path(&["identifications", "identification"]))
            .flat_map(Value::items)
            .find(|identification| {
                let issuer_matches = issuer.is_none_or(|issuer| {
                    identification.get("issuer").and_then(Value::text) == Some(issuer)
                });
                let name_matches = identification
                    .path(&["name", "content"])
                    .map(Value::items)
                    .unwrap_or_default()
                    .iter()
                    .any(|content| {
                        content.text() == Some(name)
                            && lang.is_none_or(|lang| content.attribute("lang") == Some(lang))
                    });
                issuer_matches && name_matches
            })
            .and_then(|identification| identification.get("value"))
            .and_then(Value::text)
            .map(str::to_string)
    }

    /// Every result quantity, labelled by name (in the mandatory language)
    /// or by XPath-like locator.
    pub fn get_calibration_results(&self, label: ResultLabel) -> Vec<(String, Value)> {
        calibration_results(self.document_element(), label, self.mandatory_language())
    }

    /// The `metaData` block with the given `refType`, as `{metaData: …}`.
    pub fn get_calibration_metadata(&self, ref_type: &str) -> Option<Value> {
        find_element_by_ref_type(&self.tree, "metaData", ref_type)
            .map(|metadata| tagged("metaData", metadata))
    }

    pub fn has_previous_report(&self) -> bool {
        self.document_element()
            .path(&["administrativeData", "coreData", "previousReport"])
            .is_some()
    }

    pub fn generate_compressed_dcc(&self) -> Result<CompressedDcc, Error> {
        Ok(CompressedDcc::new(&self.raw, self.codec.as_ref())?)
    }

    /// Validate against the XSD and record the outcome as `VALID_SCHEMA`.
    pub fn verify_dcc_xml(&mut self, online: bool) -> bool {
        self.verify_schema(SchemaMode::from_online_flag(online))
    }

    /// [`Dcc::verify_dcc_xml`] in the configured [`Config::schema_mode`].
    pub fn verify_default_schema(&mut self) -> bool {
        self.verify_schema(self.config.schema_mode())
    }

    fn verify_schema(&mut self, mode: SchemaMode) -> bool {
        let fetcher = match resolve_fetcher(&self.fetcher, &self.config) {
            Ok(fetcher) => fetcher,
            Err(err) => {
                warn!(error = %err, "no fetcher available for schema validation");
                self.status.fail(StatusKind::ValidSchema, err.to_string());
                return false;
            }
        };
        let valid = schema::validate(&self.raw, &self.tree, mode, &self.config, fetcher.as_ref());
        if valid {
            self.status.set(StatusKind::ValidSchema, CheckState::Pass);
        } else {
            self.status.fail(
                StatusKind::ValidSchema,
                format!("{} schema validation failed", mode.as_str()),
            );
        }
        valid
    }

    /// Verify the embedded signature against `store` and record the result.
    ///
    /// Unsigned documents are left untouched.
    pub fn verify_signature(&mut self, store: &TrustStore) -> Result<(), SignatureError> {
        if !self.status.is_signed() {
            debug!("document is not signed, nothing to verify");
            return Ok(());
        }
        let at = self
            .config
            .verification_time()
            .or(store.verification_time())
            .unwrap_or_else(Utc::now);
        match signature::verify(&self.raw, store, at) {
            Ok(record) => {
                for kind in [
                    StatusKind::ValidSignature,
                    StatusKind::ValidChain,
                    StatusKind::NotRevoked,
                ] {
                    self.status.set(kind, CheckState::Pass);
                }
                info!(signer = %record.signer().subject(), signing_time = %record.signing_time(), "signature verified");
                self.signature = Some(record);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "signature verification failed");
                self.signature = None;
                self.status.fail(StatusKind::ValidSignature, err.to_string());
                match &err {
                    SignatureError::Trust(_) => {
                        self.status.fail(StatusKind::ValidChain, err.to_string());
                        self.status.set(StatusKind::NotRevoked, CheckState::NotApplicable);
                    }
                    SignatureError::Revoked(_) => {
                        self.status.set(StatusKind::ValidChain, CheckState::Pass);
                        self.status.fail(StatusKind::NotRevoked, err.to_string());
                    }
                    SignatureError::Integrity(_) | SignatureError::Malformed(_) => {
                        self.status.set(StatusKind::ValidChain, CheckState::NotApplicable);
                        self.status.set(StatusKind::NotRevoked, CheckState::NotApplicable);
                    }
                }
                Err(err)
            }
        }
    }

    /// Declared signing time, once the signature has been verified.
    pub fn get_signing_time(&self) -> Option<DateTime<Utc>> {
        self.signature.as_ref().map(SignatureRecord::signing_time)
    }

    /// Signer certificate, once the signature has been verified.
    pub fn get_signer_certificate(&self) -> Option<&ParsedCertificate> {
        self.signature.as_ref().map(SignatureRecord::signer)
    }

    pub fn signature_record(&self) -> Option<&SignatureRecord> {
        self.signature.as_ref()
    }
}
