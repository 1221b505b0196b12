//! Verification of the enveloped XML-DSig / XAdES signature of a DCC.
//!
//! Verification runs in a fixed order and stops at the first failure:
//! 1. every `ds:Reference` is resolved, transformed and its digest compared;
//!    at least one of them must cover the whole document,
//! 2. `ds:SignatureValue` is checked over the canonical `ds:SignedInfo`
//!    with the key of the embedded signer certificate,
//! 3. the signer certificate is chained to the trust store and checked for
//!    revocation,
//! 4. the XAdES `SigningTime` is read.
use base64ct::{Base64, Encoding};
use chrono::{DateTime, NaiveDateTime, Utc};
use libxml::{
    parser::Parser,
    tree::{Document, Node, c14n},
    xpath,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use x509_cert::{der::Encode, spki::DecodePublicKey};

use crate::{
    constants::{
        C14N, C14N_WITH_COMMENTS, C14N11, C14N11_WITH_COMMENTS, DS_NS, ECDSA_SHA256, ECDSA_SHA384,
        ENVELOPED_SIGNATURE, EXC_C14N, EXC_C14N_NS, EXC_C14N_WITH_COMMENTS, RSA_SHA1, RSA_SHA256,
        RSA_SHA384, RSA_SHA512, SHA1, SHA256, SHA384, SHA512, XADES_NS,
    },
    revocation::Revoked,
    trust::{
        ChainError, EcdsaDigest, EcdsaEncoding, ParsedCertificate, TrustStore, verify_ecdsa,
    },
    tree::Value,
};

const SIGNATURE_XPATH: &str = "/*/ds:Signature";
const SIGNER_CERT_XPATH: &str = "/*/ds:Signature/ds:KeyInfo/ds:X509Data/ds:X509Certificate";
const SIGNING_TIME_XPATH: &str =
    "/*/ds:Signature//xades:SignedProperties/xades:SignedSignatureProperties/xades:SigningTime";

/// Failure of an explicitly requested signature verification.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// Digest or signature value does not match the document.
    #[error("signature integrity check failed: {0}")]
    Integrity(String),
    /// Signer certificate does not chain to the trust store.
    #[error("signer certificate is not trusted: {0}")]
    Trust(#[from] ChainError),
    #[error("signer certificate failed revocation check: {0}")]
    Revoked(#[from] Revoked),
    /// Signature block is incomplete or uses something unsupported.
    #[error("malformed signature: {0}")]
    Malformed(String),
}

fn malformed(message: impl Into<String>) -> SignatureError {
    SignatureError::Malformed(message.into())
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct SignatureRecord {
    signer: ParsedCertificate,
    signed_info: Vec<u8>,
    signature_value: Vec<u8>,
    signature_method: String,
    digest_methods: Vec<String>,
    signing_time: DateTime<Utc>,
}

impl SignatureRecord {
    pub fn signer(&self) -> &ParsedCertificate {
        &self.signer
    }

    /// Canonical `ds:SignedInfo`, the input of the signature value.
    pub fn signed_info(&self) -> &[u8] {
        &self.signed_info
    }

    pub fn signature_value(&self) -> &[u8] {
        &self.signature_value
    }

    pub fn signature_method(&self) -> &str {
        &self.signature_method
    }

    /// Digest algorithm of every reference, in document order.
    pub fn digest_methods(&self) -> &[String] {
        &self.digest_methods
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }
}

/// Whether the document element carries a `Signature` child.
pub fn is_signed(tree: &Value) -> bool {
    tree.as_mapping()
        .and_then(|root| root.iter().next())
        .is_some_and(|(_, element)| element.get("Signature").is_some())
}

/// Verify the signature embedded in `raw_xml` against `store` at `at`.
#[instrument(skip_all, fields(bytes = raw_xml.len()))]
pub fn verify(
    raw_xml: &[u8],
    store: &TrustStore,
    at: DateTime<Utc>,
) -> Result<SignatureRecord, SignatureError> {
    let document = Parser::default()
        .parse_string(raw_xml)
        .map_err(|e| malformed(format!("XML parse error: {e:?}")))?;
    let ctx = xpath_context(&document)?;
    let signature = first_node(&ctx, SIGNATURE_XPATH)?
        .ok_or_else(|| malformed("document has no ds:Signature"))?;
    let signed_info = ds_child(&signature, "SignedInfo")
        .ok_or_else(|| malformed("missing ds:SignedInfo"))?;
    let c14n_method = ds_child(&signed_info, "CanonicalizationMethod")
        .ok_or_else(|| malformed("missing ds:CanonicalizationMethod"))?;
    let signature_method = algorithm_of(&signed_info, "SignatureMethod")?;
    let signer = signer_certificate(&ctx)?;

    let references = ds_children(&signed_info, "Reference");
    if references.is_empty() {
        return Err(malformed("ds:SignedInfo has no ds:Reference"));
    }
    let mut digest_methods = Vec::with_capacity(references.len());
    let mut covers_document = false;
    for reference in &references {
        let checked = verify_reference(&document, reference)?;
        covers_document |= checked.covers_document;
        digest_methods.push(checked.digest_method);
    }
    if !covers_document {
        warn!("no reference covers the document");
        return Err(SignatureError::Integrity(
            "no ds:Reference covers the document".into(),
        ));
    }
    debug!(references = references.len(), "reference digests match");

    let (_, signed_info_options) = canonicalization(&c14n_method)?;
    let mut signed_info_node = signed_info.clone();
    let canonical_signed_info = signed_info_node
        .canonicalize(signed_info_options)
        .map_err(|()| malformed("failed to canonicalize ds:SignedInfo"))?
        .into_bytes();
    let signature_value = ds_child(&signature, "SignatureValue")
        .ok_or_else(|| malformed("missing ds:SignatureValue"))
        .and_then(|node| decode_base64(&node.get_content(), "ds:SignatureValue"))?;
    verify_signature_value(
        &signature_method,
        &signer,
        &canonical_signed_info,
        &signature_value,
    )?;
    debug!(method = %signature_method, "signature value verified");

    let chain = store.build_chain_at(&signer, at)?;
    store.check_revocation_at(&chain, at)?;
    debug!(depth = chain.len(), "signer certificate trusted");

    let signing_time = signing_time(&ctx)?;
    Ok(SignatureRecord {
        signer,
        signed_info: canonical_signed_info,
        signature_value,
        signature_method,
        digest_methods,
        signing_time,
    })
}

fn xpath_context(document: &Document) -> Result<xpath::Context, SignatureError> {
    let ctx = xpath::Context::new(document)
        .map_err(|e| malformed(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("ds", DS_NS)
        .map_err(|e| malformed(format!("XPath context error: {e:?}")))?;
    ctx.register_namespace("xades", XADES_NS)
        .map_err(|e| malformed(format!("XPath context error: {e:?}")))?;
    Ok(ctx)
}

fn first_node(ctx: &xpath::Context, expr: &str) -> Result<Option<Node>, SignatureError> {
    let nodes = ctx
        .evaluate(expr)
        .map_err(|e| malformed(format!("XPath error for {expr}: {e:?}")))?
        .get_nodes_as_vec();
    Ok(nodes.into_iter().next())
}

fn ds_children(parent: &Node, local_name: &str) -> Vec<Node> {
    parent
        .get_child_elements()
        .into_iter()
        .filter(|child| {
            child.get_name() == local_name
                && child.get_namespace().is_some_and(|ns| ns.get_href() == DS_NS)
        })
        .collect()
}

fn ds_child(parent: &Node, local_name: &str) -> Option<Node> {
    ds_children(parent, local_name).into_iter().next()
}

fn algorithm_of(parent: &Node, local_name: &str) -> Result<String, SignatureError> {
    ds_child(parent, local_name)
        .and_then(|node| node.get_attribute("Algorithm"))
        .ok_or_else(|| malformed(format!("missing Algorithm on ds:{local_name}")))
}

fn decode_base64(text: &str, label: &str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Base64::decode_vec(&compact).map_err(|e| malformed(format!("invalid base64 in {label}: {e}")))
}

fn signer_certificate(ctx: &xpath::Context) -> Result<ParsedCertificate, SignatureError> {
    let node = first_node(ctx, SIGNER_CERT_XPATH)?
        .ok_or_else(|| malformed("missing ds:X509Certificate"))?;
    let der = decode_base64(&node.get_content(), "ds:X509Certificate")?;
    ParsedCertificate::from_der(&der)
        .map_err(|e| malformed(format!("unparsable signer certificate: {e}")))
}

/// Algorithm and options of a `ds:CanonicalizationMethod` or `ds:Transform`.
fn canonicalization(
    node: &Node,
) -> Result<(String, c14n::CanonicalizationOptions), SignatureError> {
    let uri = node
        .get_attribute("Algorithm")
        .ok_or_else(|| malformed(format!("missing Algorithm on ds:{}", node.get_name())))?;
    let options = c14n_options(&uri, inclusive_prefixes(node))?;
    Ok((uri, options))
}

/// Prefixes listed by an `ec:InclusiveNamespaces` child of `node`.
fn inclusive_prefixes(node: &Node) -> Vec<String> {
    node.get_child_elements()
        .into_iter()
        .filter(|child| {
            child.get_name() == "InclusiveNamespaces"
                && child.get_namespace().is_some_and(|ns| ns.get_href() == EXC_C14N_NS)
        })
        .filter_map(|child| child.get_attribute("PrefixList"))
        .flat_map(|list| {
            list.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn c14n_options(
    uri: &str,
    inclusive_ns_prefixes: Vec<String>,
) -> Result<c14n::CanonicalizationOptions, SignatureError> {
    let (mode, with_comments) = match uri {
        C14N => (c14n::CanonicalizationMode::Canonical1_0, false),
        C14N_WITH_COMMENTS => (c14n::CanonicalizationMode::Canonical1_0, true),
        C14N11 => (c14n::CanonicalizationMode::Canonical1_1, false),
        C14N11_WITH_COMMENTS => (c14n::CanonicalizationMode::Canonical1_1, true),
        EXC_C14N => (c14n::CanonicalizationMode::ExclusiveCanonical1_0, false),
        EXC_C14N_WITH_COMMENTS => (c14n::CanonicalizationMode::ExclusiveCanonical1_0, true),
        other => return Err(malformed(format!("unsupported canonicalization: {other}"))),
    };
    let inclusive_ns_prefixes = if mode == c14n::CanonicalizationMode::ExclusiveCanonical1_0 {
        inclusive_ns_prefixes
    } else {
        Vec::new()
    };
    Ok(c14n::CanonicalizationOptions {
        mode,
        inclusive_ns_prefixes,
        with_comments,
    })
}

fn digest(uri: &str, data: &[u8]) -> Result<Vec<u8>, SignatureError> {
    Ok(match uri {
        SHA1 => Sha1::digest(data).to_vec(),
        SHA256 => Sha256::digest(data).to_vec(),
        SHA384 => Sha384::digest(data).to_vec(),
        SHA512 => Sha512::digest(data).to_vec(),
        other => return Err(malformed(format!("unsupported digest method: {other}"))),
    })
}

/// A reference whose digest matched.
struct CheckedReference {
    digest_method: String,
    /// The reference spans the document element, minus the signature itself.
    covers_document: bool,
}

fn verify_reference(
    document: &Document,
    reference: &Node,
) -> Result<CheckedReference, SignatureError> {
    let uri = reference.get_attribute("URI").unwrap_or_default();
    let digest_method = algorithm_of(reference, "DigestMethod")?;
    let expected = ds_child(reference, "DigestValue")
        .ok_or_else(|| malformed("missing ds:DigestValue"))
        .and_then(|node| decode_base64(&node.get_content(), "ds:DigestValue"))?;

    let transforms = ds_child(reference, "Transforms")
        .map(|node| ds_children(&node, "Transform"))
        .unwrap_or_default();
    let mut enveloped = false;
    let mut options = c14n_options(C14N, Vec::new())?;
    for transform in &transforms {
        if transform.get_attribute("Algorithm").as_deref() == Some(ENVELOPED_SIGNATURE) {
            enveloped = true;
        } else {
            (_, options) = canonicalization(transform)?;
        }
    }

    let working = document
        .dup()
        .map_err(|e| malformed(format!("failed to duplicate document: {e:?}")))?;
    let ctx = xpath_context(&working)?;
    if enveloped {
        if let Some(mut signature) = first_node(&ctx, SIGNATURE_XPATH)? {
            signature.unlink();
        }
    }
    let (canonical, covers_document) = if uri.is_empty() {
        (working.canonicalize(options, None), enveloped)
    } else if let Some(id) = uri.strip_prefix('#') {
        let mut target = element_by_id(&ctx, id)?;
        let is_document_element = working
            .get_root_element()
            .is_some_and(|root| root == target);
        (target.canonicalize(options), is_document_element && enveloped)
    } else {
        return Err(malformed(format!("unsupported reference URI: {uri}")));
    };
    let canonical = canonical
        .map_err(|()| malformed(format!("failed to canonicalize reference '{uri}'")))?;

    let computed = digest(&digest_method, canonical.as_bytes())?;
    if computed != expected {
        warn!(%uri, "reference digest mismatch");
        return Err(SignatureError::Integrity(format!(
            "digest of reference '{uri}' does not match"
        )));
    }
    Ok(CheckedReference {
        digest_method,
        covers_document,
    })
}

fn element_by_id(ctx: &xpath::Context, id: &str) -> Result<Node, SignatureError> {
    if id.contains('\'') {
        return Err(malformed(format!("unsupported reference id: {id}")));
    }
    first_node(ctx, &format!("//*[@Id='{id}' or @ID='{id}' or @id='{id}']"))?
        .ok_or_else(|| malformed(format!("reference target #{id} not found")))
}

fn verify_signature_value(
    method: &str,
    signer: &ParsedCertificate,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let spki_der = signer
        .public_key_info()
        .to_der()
        .map_err(|e| malformed(format!("failed to encode signer key: {e}")))?;
    let verified = match method {
        RSA_SHA1 => verify_rsa::<Sha1>(&spki_der, message, signature)?,
        RSA_SHA256 => verify_rsa::<Sha256>(&spki_der, message, signature)?,
        RSA_SHA384 => verify_rsa::<Sha384>(&spki_der, message, signature)?,
        RSA_SHA512 => verify_rsa::<Sha512>(&spki_der, message, signature)?,
        ECDSA_SHA256 => verify_ecdsa(
            signer.public_key_info(),
            EcdsaDigest::Sha256,
            EcdsaEncoding::Fixed,
            message,
            signature,
        )
        .map_err(malformed)?,
        ECDSA_SHA384 => verify_ecdsa(
            signer.public_key_info(),
            EcdsaDigest::Sha384,
            EcdsaEncoding::Fixed,
            message,
            signature,
        )
        .map_err(malformed)?,
        other => return Err(malformed(format!("unsupported signature method: {other}"))),
    };
    verified.map_err(|e| SignatureError::Integrity(format!("signature value does not verify: {e}")))
}

fn verify_rsa<D>(
    spki_der: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<Result<(), signature::Error>, SignatureError>
where
    D: Digest + x509_cert::der::oid::AssociatedOid,
{
    let public_key = rsa::RsaPublicKey::from_public_key_der(spki_der)
        .map_err(|e| malformed(format!("signer key is not RSA: {e}")))?;
    let key = rsa::pkcs1v15::VerifyingKey::<D>::new(public_key);
    Ok(rsa::pkcs1v15::Signature::try_from(signature)
        .and_then(|sig| signature::Verifier::verify(&key, message, &sig)))
}

fn signing_time(ctx: &xpath::Context) -> Result<DateTime<Utc>, SignatureError> {
    let node = first_node(ctx, SIGNING_TIME_XPATH)?
        .ok_or_else(|| malformed("missing xades:SigningTime"))?;
    let text = node.get_content();
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").map(|naive| naive.and_utc())
        })
        .map_err(|e| malformed(format!("invalid signing time '{text}': {e}")))
}
