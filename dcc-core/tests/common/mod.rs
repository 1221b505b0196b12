use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64ct::{Base64, Encoding};
use dcc_core::fetch::{FetchError, Fetcher};
use dcc_core::trust::TrustStore;
use libxml::parser::Parser;
use libxml::tree::c14n::{CanonicalizationMode, CanonicalizationOptions};
use libxml::xpath;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{DerSignature, Signature, SigningKey};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::der::asn1::{BitString, Ia5String, ObjectIdentifier, UtcTime};
use x509_cert::der::pem::LineEnding;
use x509_cert::der::{Encode, EncodePem};
use x509_cert::ext::pkix::CrlDistributionPoints;
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};

pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const GP_DCC: &str = "dcc_gp_temperature_typical_v12.xml";
pub const QOX_DCC: &str = "dcc_gp_temperature_typical_v12_QoX.xml";
pub const WRONG_SCHEMA_DCC: &str = "siliziumkugel_wrong_schema.xml";
pub const SIGNING_TIME: &str = "2023-03-27T15:14:30Z";

const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const DOCUMENT_ELEMENT_END: &str = "</dcc:digitalCalibrationCertificate>";

#[allow(dead_code)]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/dcc")
        .join(name)
}

#[allow(dead_code)]
pub fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("read fixture")
}

#[allow(dead_code)]
pub fn schema_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/schema/dcc.xsd")
}

/// Fetcher answering from an in-memory URL map and recording every request.
#[derive(Debug, Default)]
pub struct FakeFetcher {
    responses: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.to_string(), body.into());
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(url.to_string());
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Network(format!("connection refused: {url}")))
    }
}

/// Root → intermediate → signer, all P-256.
pub struct TestPki {
    pub root_key: SigningKey,
    pub root: Certificate,
    pub sub_key: SigningKey,
    pub sub: Certificate,
    pub signer_key: SigningKey,
    pub signer: Certificate,
}

#[allow(dead_code)]
impl TestPki {
    /// `seed` keeps the keys of independent hierarchies apart.
    pub fn new(label: &str, seed: u8) -> Self {
        Self::build(label, seed, None)
    }

    /// Like [`TestPki::new`], with a CRL distribution point on the signer.
    pub fn with_crl_url(label: &str, seed: u8, crl_url: &str) -> Self {
        Self::build(label, seed, Some(crl_url))
    }

    fn build(label: &str, seed: u8, crl_url: Option<&str>) -> Self {
        let root_key = test_key(seed);
        let sub_key = test_key(seed.wrapping_add(1));
        let signer_key = test_key(seed.wrapping_add(2));

        let root_name = format!("CN={label} Root CA,O=DCC Test,C=DE");
        let sub_name = format!("CN={label} Sub CA,O=DCC Test,C=DE");
        let signer_name = format!("CN={label} Signer,O=Kalibrierfirma GmbH,C=DE");

        let root = issue(Profile::Root, 1, &root_name, &root_key, &root_key, None);
        let sub = issue(
            Profile::SubCA {
                issuer: root.tbs_certificate.subject.clone(),
                path_len_constraint: None,
            },
            2,
            &sub_name,
            &sub_key,
            &root_key,
            None,
        );
        let signer = issue(
            Profile::Leaf {
                issuer: sub.tbs_certificate.subject.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            3,
            &signer_name,
            &signer_key,
            &sub_key,
            crl_url.map(distribution_points),
        );

        Self {
            root_key,
            root,
            sub_key,
            sub,
            signer_key,
            signer,
        }
    }

    /// Store trusting this hierarchy's root, with its intermediate loaded.
    pub fn trust_store(&self) -> TrustStore {
        let mut store = TrustStore::new();
        store
            .load_trusted_root_from_bytes(&pem(&self.root).into_bytes())
            .expect("load root");
        store
            .load_intermediate_from_bytes(&der(&self.sub))
            .expect("load intermediate");
        store
    }

    pub fn sign(&self, xml: &str) -> String {
        sign_dcc(xml, &self.signer_key, &self.signer)
    }

    /// CRL issued by the intermediate, listing the signer as revoked.
    pub fn crl_revoking_signer(&self) -> Vec<u8> {
        build_crl(
            &self.sub,
            &self.sub_key,
            &[self.signer.tbs_certificate.serial_number.clone()],
        )
    }

    /// CRL issued by the intermediate with no entries.
    pub fn empty_crl(&self) -> Vec<u8> {
        build_crl(&self.sub, &self.sub_key, &[])
    }
}

#[allow(dead_code)]
pub fn test_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).expect("valid P-256 scalar")
}

#[allow(dead_code)]
pub fn der(certificate: &Certificate) -> Vec<u8> {
    certificate.to_der().expect("certificate der")
}

#[allow(dead_code)]
pub fn pem(certificate: &Certificate) -> String {
    certificate.to_pem(LineEnding::LF).expect("certificate pem")
}

fn distribution_points(url: &str) -> CrlDistributionPoints {
    let uri = Ia5String::new(url).expect("ia5 url");
    CrlDistributionPoints(vec![DistributionPoint {
        distribution_point: Some(DistributionPointName::FullName(vec![
            GeneralName::UniformResourceIdentifier(uri),
        ])),
        reasons: None,
        crl_issuer: None,
    }])
}

#[allow(dead_code)]
pub fn issue(
    profile: Profile,
    serial: u8,
    subject: &str,
    key: &SigningKey,
    issuer_key: &SigningKey,
    crl_distribution_points: Option<CrlDistributionPoints>,
) -> Certificate {
    let spki = SubjectPublicKeyInfoOwned::from_key(*key.verifying_key()).expect("spki");
    let mut builder = CertificateBuilder::new(
        profile,
        SerialNumber::new(&[serial]).expect("serial"),
        Validity::from_now(Duration::from_secs(365 * 24 * 60 * 60)).expect("validity"),
        Name::from_str(subject).expect("subject"),
        spki,
        issuer_key,
    )
    .expect("certificate builder");
    if let Some(points) = crl_distribution_points {
        builder
            .add_extension(&points)
            .expect("crl distribution points");
    }
    builder.build::<DerSignature>().expect("sign certificate")
}

#[allow(dead_code)]
pub fn build_crl(issuer: &Certificate, issuer_key: &SigningKey, revoked: &[SerialNumber]) -> Vec<u8> {
    let now = SystemTime::now();
    let time = |at: SystemTime| {
        let since_epoch = at.duration_since(UNIX_EPOCH).expect("after epoch");
        Time::UtcTime(UtcTime::from_unix_duration(since_epoch).expect("crl time"))
    };
    let revoked_certificates = revoked
        .iter()
        .map(|serial| RevokedCert {
            serial_number: serial.clone(),
            revocation_date: time(now - Duration::from_secs(60)),
            crl_entry_extensions: None,
        })
        .collect::<Vec<_>>();
    let algorithm = AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA256,
        parameters: None,
    };
    let tbs_cert_list = TbsCertList {
        version: x509_cert::Version::V2,
        signature: algorithm.clone(),
        issuer: issuer.tbs_certificate.subject.clone(),
        this_update: time(now - Duration::from_secs(3600)),
        next_update: Some(time(now + Duration::from_secs(24 * 3600))),
        revoked_certificates: (!revoked_certificates.is_empty()).then_some(revoked_certificates),
        crl_extensions: None,
    };
    let tbs = tbs_cert_list.to_der().expect("tbs crl der");
    let signature: DerSignature = issuer_key.sign(&tbs);
    CertificateList {
        tbs_cert_list,
        signature_algorithm: algorithm,
        signature: BitString::from_bytes(signature.as_bytes()).expect("signature bits"),
    }
    .to_der()
    .expect("crl der")
}

const SIGNATURE_TEMPLATE: &str = r##"<ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#" Id="dcc-signature">
    <ds:SignedInfo>
      @CANONICALIZATION_METHOD@
      <ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256"/>
      @DOCUMENT_REFERENCE@
      <ds:Reference Type="http://uri.etsi.org/01903#SignedProperties" URI="#dcc-signed-properties">
        @PROPERTIES_TRANSFORMS@
        <ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>
        <ds:DigestValue>@PROPERTIES_DIGEST@</ds:DigestValue>
      </ds:Reference>
    </ds:SignedInfo>
    <ds:SignatureValue>@SIGNATURE_VALUE@</ds:SignatureValue>
    <ds:KeyInfo>
      <ds:X509Data>
        <ds:X509Certificate>@SIGNER_CERTIFICATE@</ds:X509Certificate>
      </ds:X509Data>
    </ds:KeyInfo>
    <ds:Object>
      <xades:QualifyingProperties xmlns:xades="http://uri.etsi.org/01903/v1.3.2#" Target="#dcc-signature">
        <xades:SignedProperties Id="dcc-signed-properties">
          <xades:SignedSignatureProperties>
            <xades:SigningTime>@SIGNING_TIME@</xades:SigningTime>
          </xades:SignedSignatureProperties>
        </xades:SignedProperties>
      </xades:QualifyingProperties>
    </ds:Object>
  </ds:Signature>
"##;

const DOCUMENT_REFERENCE: &str = r#"<ds:Reference Id="dcc-reference" URI="">
        <ds:Transforms>
          <ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/>
          <ds:Transform Algorithm="http://www.w3.org/TR/2001/REC-xml-c14n-20010315"/>
        </ds:Transforms>
        <ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"/>
        <ds:DigestValue>@DOCUMENT_DIGEST@</ds:DigestValue>
      </ds:Reference>"#;

const C14N_METHOD: &str =
    r#"<ds:CanonicalizationMethod Algorithm="http://www.w3.org/TR/2001/REC-xml-c14n-20010315"/>"#;

const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Shape of the signature written by [`sign_dcc_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SigningOptions {
    /// Leave out the enveloped reference over the whole document.
    pub properties_only: bool,
    /// Canonicalize `SignedInfo` and `SignedProperties` with exclusive C14N
    /// and this `InclusiveNamespaces` prefix list.
    pub exclusive_prefixes: Option<&'static str>,
}

fn inclusive_namespaces(prefixes: &str) -> String {
    format!(r#"<ec:InclusiveNamespaces xmlns:ec="{EXC_C14N}" PrefixList="{prefixes}"/>"#)
}

fn canonical_options() -> CanonicalizationOptions {
    CanonicalizationOptions {
        mode: CanonicalizationMode::Canonical1_0,
        inclusive_ns_prefixes: vec![],
        with_comments: false,
    }
}

fn exclusive_options(prefixes: Option<&str>) -> CanonicalizationOptions {
    match prefixes {
        Some(list) => CanonicalizationOptions {
            mode: CanonicalizationMode::ExclusiveCanonical1_0,
            inclusive_ns_prefixes: list.split_whitespace().map(str::to_string).collect(),
            with_comments: false,
        },
        None => canonical_options(),
    }
}

fn first_node(ctx: &xpath::Context, expr: &str) -> libxml::tree::Node {
    ctx.evaluate(expr)
        .expect("xpath")
        .get_nodes_as_vec()
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("no node for {expr}"))
}

fn context(document: &libxml::tree::Document) -> xpath::Context {
    let ctx = xpath::Context::new(document).expect("xpath context");
    ctx.register_namespace("ds", DS_NS).expect("ds ns");
    ctx.register_namespace("xades", "http://uri.etsi.org/01903/v1.3.2#")
        .expect("xades ns");
    ctx
}

fn digest_b64(bytes: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(bytes))
}

/// Embed an enveloped XAdES signature made with `key` into an unsigned DCC.
#[allow(dead_code)]
pub fn sign_dcc(xml: &str, key: &SigningKey, certificate: &Certificate) -> String {
    sign_dcc_with(xml, key, certificate, SigningOptions::default())
}

#[allow(dead_code)]
pub fn sign_dcc_with(
    xml: &str,
    key: &SigningKey,
    certificate: &Certificate,
    options: SigningOptions,
) -> String {
    let end = xml.rfind(DOCUMENT_ELEMENT_END).expect("document element end");
    let (canonicalization_method, properties_transforms) = match options.exclusive_prefixes {
        Some(prefixes) => (
            format!(
                r#"<ds:CanonicalizationMethod Algorithm="{EXC_C14N}">{}</ds:CanonicalizationMethod>"#,
                inclusive_namespaces(prefixes)
            ),
            format!(
                r#"<ds:Transforms><ds:Transform Algorithm="{EXC_C14N}">{}</ds:Transform></ds:Transforms>"#,
                inclusive_namespaces(prefixes)
            ),
        ),
        None => (C14N_METHOD.to_string(), String::new()),
    };
    let template = SIGNATURE_TEMPLATE
        .replace("@CANONICALIZATION_METHOD@", &canonicalization_method)
        .replace(
            "@DOCUMENT_REFERENCE@",
            if options.properties_only { "" } else { DOCUMENT_REFERENCE },
        )
        .replace("@PROPERTIES_TRANSFORMS@", &properties_transforms)
        .replace("@SIGNER_CERTIFICATE@", &Base64::encode_string(&der(certificate)))
        .replace("@SIGNING_TIME@", SIGNING_TIME);
    let mut signed = format!("{}{}{}", &xml[..end], template, &xml[end..]);

    let (document_digest, properties_digest) = {
        let document = Parser::default()
            .parse_string(&signed)
            .expect("parse signature template");
        let ctx = context(&document);
        let mut properties = first_node(&ctx, "//xades:SignedProperties");
        let properties_c14n = properties
            .canonicalize(exclusive_options(options.exclusive_prefixes))
            .expect("canonical signed properties");

        let mut signature = first_node(&ctx, "/*/ds:Signature");
        signature.unlink();
        let document_c14n = document
            .canonicalize(canonical_options(), None)
            .expect("canonical document");
        (
            digest_b64(document_c14n.as_bytes()),
            digest_b64(properties_c14n.as_bytes()),
        )
    };
    signed = signed
        .replace("@DOCUMENT_DIGEST@", &document_digest)
        .replace("@PROPERTIES_DIGEST@", &properties_digest);

    let signed_info_c14n = {
        let document = Parser::default()
            .parse_string(&signed)
            .expect("parse digested template");
        let ctx = context(&document);
        let mut signed_info = first_node(&ctx, "/*/ds:Signature/ds:SignedInfo");
        signed_info
            .canonicalize(exclusive_options(options.exclusive_prefixes))
            .expect("canonical signed info")
    };
    let signature: Signature = key.sign(signed_info_c14n.as_bytes());
    signed.replace(
        "@SIGNATURE_VALUE@",
        &Base64::encode_string(&signature.to_bytes()),
    )
}
