//! Trust store: trusted root, intermediates and certificate chain building.
use std::{fmt, fs, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256, Sha384, Sha512};
use signature::hazmat::PrehashVerifier;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use x509_cert::{
    Certificate,
    der::{Decode, Encode, asn1::ObjectIdentifier, pem},
    ext::pkix::{BasicConstraints, KeyUsage},
    spki::{DecodePublicKey, SubjectPublicKeyInfoOwned},
    time::Time,
};

use crate::{
    constants::{
        OID_CURVE_P256, OID_CURVE_P384, OID_ECDSA_SHA256, OID_ECDSA_SHA384, OID_SHA1_RSA,
        OID_SHA256_RSA, OID_SHA384_RSA, OID_SHA512_RSA,
    },
    revocation::{CrlRevocationSource, RevocationSource, RevocationStatus, Revoked},
};

/// Longest signer → root path that is followed.
pub const MAX_CHAIN_DEPTH: usize = 10;

/// Errors raised while loading certificates or CRLs into a [`TrustStore`].
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid PEM: {0}")]
    Pem(String),
    #[error("invalid DER: {0}")]
    Der(#[from] x509_cert::der::Error),
}

/// Reasons a signer certificate cannot be connected to the trusted root.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// No issuer for `subject` among the intermediates or the root.
    #[error("no issuer found for {subject}")]
    ChainBroken { subject: String },
    /// A certificate on the path is outside its validity window.
    #[error("certificate {subject} is not valid at {at} (valid {not_before} .. {not_after})")]
    ExpiredCertificate {
        subject: String,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    #[error("trust store has no trusted root")]
    NoTrustedRoot,
    #[error("malformed certificate: {0}")]
    Certificate(String),
}

/// An X.509 certificate together with its DER encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    certificate: Certificate,
    der: Vec<u8>,
}

impl fmt::Debug for ParsedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedCertificate")
            .field("subject", &self.subject())
            .field("issuer", &self.issuer())
            .field("serial", &self.serial())
            .finish()
    }
}

impl ParsedCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, TrustError> {
        let certificate = Certificate::from_der(der)?;
        Ok(Self {
            certificate,
            der: der.to_vec(),
        })
    }

    /// Parse a PEM block or raw DER, whichever `bytes` holds.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TrustError> {
        Self::from_der(&der_from_pem_or_der(bytes)?)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }

    pub fn issuer(&self) -> String {
        self.certificate.tbs_certificate.issuer.to_string()
    }

    /// Serial number in decimal notation.
    pub fn serial(&self) -> String {
        serial_bytes_to_decimal_string(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        time_to_utc(&self.certificate.tbs_certificate.validity.not_before)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        time_to_utc(&self.certificate.tbs_certificate.validity.not_after)
    }

    pub(crate) fn public_key_info(&self) -> &SubjectPublicKeyInfoOwned {
        &self.certificate.tbs_certificate.subject_public_key_info
    }

    fn is_issued_by(&self, issuer: &ParsedCertificate) -> bool {
        if self.certificate.tbs_certificate.issuer != issuer.certificate.tbs_certificate.subject {
            return false;
        }
        if !issuer.is_ca() {
            debug!(issuer = %issuer.subject(), "candidate issuer is not a CA");
            return false;
        }
        verify_certificate_signature(&self.certificate, issuer.public_key_info()).is_ok()
    }

    /// basicConstraints `cA` is set and keyUsage, when present, allows
    /// `keyCertSign`.
    fn is_ca(&self) -> bool {
        let tbs = &self.certificate.tbs_certificate;
        let ca = matches!(
            tbs.get::<BasicConstraints>(),
            Ok(Some((_, constraints))) if constraints.ca
        );
        let may_sign_certificates = match tbs.get::<KeyUsage>() {
            Ok(Some((_, usage))) => usage.key_cert_sign(),
            Ok(None) => true,
            Err(_) => false,
        };
        ca && may_sign_certificates
    }

    fn check_validity(&self, at: DateTime<Utc>) -> Result<(), ChainError> {
        let (not_before, not_after) = (self.not_before(), self.not_after());
        if at < not_before || at > not_after {
            return Err(ChainError::ExpiredCertificate {
                subject: self.subject(),
                not_before,
                not_after,
                at,
            });
        }
        Ok(())
    }
}

/// Signer first, trusted root last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<ParsedCertificate>,
}

impl CertificateChain {
    pub fn signer(&self) -> &ParsedCertificate {
        &self.certificates[0]
    }

    pub fn root(&self) -> &ParsedCertificate {
        &self.certificates[self.certificates.len() - 1]
    }

    pub fn certificates(&self) -> &[ParsedCertificate] {
        &self.certificates
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// `(certificate, issuer)` pairs for every link of the chain.
    pub fn links(&self) -> impl Iterator<Item = (&ParsedCertificate, &ParsedCertificate)> {
        self.certificates.windows(2).map(|pair| (&pair[0], &pair[1]))
    }
}

/// Root and intermediate certificates a signer is validated against.
///
/// Populate the store first, then share it read-only (for example behind an
/// [`Arc`]) for verification.
///
/// # Examples
/// ```rust,no_run
/// use dcc_core::trust::TrustStore;
///
/// let mut store = TrustStore::new();
/// store.load_trusted_root_from_file("certs/root.pem")?;
/// store.load_intermediate_from_file("certs/intermediate.pem")?;
/// # Ok::<(), dcc_core::trust::TrustError>(())
/// ```
#[derive(Debug, Default)]
pub struct TrustStore {
    root: Option<ParsedCertificate>,
    intermediates: Vec<ParsedCertificate>,
    crls: CrlRevocationSource,
    revocation: Option<Arc<dyn RevocationSource>>,
    verification_time: Option<DateTime<Utc>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Judge validity windows and revocation at `time` instead of now.
    pub fn verify_at(mut self, time: DateTime<Utc>) -> Self {
        self.verification_time = Some(time);
        self
    }

    /// Replace the default CRL based revocation source.
    pub fn with_revocation_source(mut self, source: Arc<dyn RevocationSource>) -> Self {
        self.revocation = Some(source);
        self
    }

    /// Configure the default CRL source (fetching, strictness).
    pub fn with_crl_source(mut self, source: CrlRevocationSource) -> Self {
        let loaded = std::mem::take(&mut self.crls);
        self.crls = source.with_crls_from(loaded);
        self
    }

    pub fn verification_time(&self) -> Option<DateTime<Utc>> {
        self.verification_time
    }

    pub fn root(&self) -> Option<&ParsedCertificate> {
        self.root.as_ref()
    }

    pub fn intermediates(&self) -> &[ParsedCertificate] {
        &self.intermediates
    }

    pub fn load_trusted_root_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), TrustError> {
        let bytes = read_file(path.as_ref())?;
        self.load_trusted_root_from_bytes(&bytes)
    }

    pub fn load_trusted_root_from_bytes(&mut self, bytes: &[u8]) -> Result<(), TrustError> {
        let root = ParsedCertificate::from_bytes(bytes)?;
        debug!(subject = %root.subject(), "loaded trusted root");
        if let Some(previous) = self.root.replace(root) {
            warn!(subject = %previous.subject(), "replaced previously loaded trusted root");
        }
        Ok(())
    }

    pub fn load_intermediate_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), TrustError> {
        let bytes = read_file(path.as_ref())?;
        self.load_intermediate_from_bytes(&bytes)
    }

    pub fn load_intermediate_from_bytes(&mut self, bytes: &[u8]) -> Result<(), TrustError> {
        let intermediate = ParsedCertificate::from_bytes(bytes)?;
        debug!(subject = %intermediate.subject(), "loaded intermediate certificate");
        self.intermediates.push(intermediate);
        Ok(())
    }

    pub fn load_crl_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), TrustError> {
        let bytes = read_file(path.as_ref())?;
        self.load_crl_from_bytes(&bytes)
    }

    pub fn load_crl_from_bytes(&mut self, bytes: &[u8]) -> Result<(), TrustError> {
        self.crls.add_crl(&der_from_pem_or_der(bytes)?)
    }

    /// Connect `signer` to the trusted root at the store's verification time.
    pub fn build_chain(&self, signer: &ParsedCertificate) -> Result<CertificateChain, ChainError> {
        self.build_chain_at(signer, self.verification_time.unwrap_or_else(Utc::now))
    }

    /// Connect `signer` through the intermediates to the trusted root.
    ///
    /// Every link must be issued by the next certificate's subject and carry
    /// a signature made by its key; every certificate on the path must be
    /// valid at `at`.
    #[instrument(skip_all, fields(signer = %signer.subject()))]
    pub fn build_chain_at(
        &self,
        signer: &ParsedCertificate,
        at: DateTime<Utc>,
    ) -> Result<CertificateChain, ChainError> {
        let root = self.root.as_ref().ok_or(ChainError::NoTrustedRoot)?;
        signer.check_validity(at)?;

        if signer.der == root.der {
            return match verify_certificate_signature(&signer.certificate, root.public_key_info()) {
                Ok(()) => Ok(CertificateChain {
                    certificates: vec![root.clone()],
                }),
                Err(err) => Err(ChainError::Certificate(err)),
            };
        }

        let mut certificates = vec![signer.clone()];
        for _ in 0..MAX_CHAIN_DEPTH {
            let current = &certificates[certificates.len() - 1];
            if current.is_issued_by(root) {
                root.check_validity(at)?;
                certificates.push(root.clone());
                debug!(depth = certificates.len(), "certificate chain built");
                return Ok(CertificateChain { certificates });
            }
            let issuer = self.intermediates.iter().find(|candidate| {
                !certificates.iter().any(|seen| seen.der == candidate.der)
                    && current.is_issued_by(candidate)
            });
            let Some(issuer) = issuer else {
                return Err(ChainError::ChainBroken {
                    subject: current.subject(),
                });
            };
            issuer.check_validity(at)?;
            certificates.push(issuer.clone());
        }
        Err(ChainError::ChainBroken {
            subject: certificates[certificates.len() - 1].subject(),
        })
    }

    /// Ask the revocation source about every non-root certificate of `chain`.
    pub fn check_revocation(&self, chain: &CertificateChain) -> Result<(), Revoked> {
        self.check_revocation_at(chain, self.verification_time.unwrap_or_else(Utc::now))
    }

    #[instrument(skip_all, fields(signer = %chain.signer().subject()))]
    pub fn check_revocation_at(
        &self,
        chain: &CertificateChain,
        at: DateTime<Utc>,
    ) -> Result<(), Revoked> {
        let source: &dyn RevocationSource = match &self.revocation {
            Some(custom) => custom.as_ref(),
            None => &self.crls,
        };
        for (certificate, issuer) in chain.links() {
            match source.status(certificate, issuer, at) {
                RevocationStatus::Good => {}
                RevocationStatus::Revoked { revoked_at } => {
                    warn!(subject = %certificate.subject(), %revoked_at, "certificate revoked");
                    return Err(Revoked::listed(certificate, revoked_at));
                }
                RevocationStatus::Unknown(reason) if source.is_strict() => {
                    warn!(subject = %certificate.subject(), %reason, "no revocation information");
                    return Err(Revoked::unknown(certificate, reason));
                }
                RevocationStatus::Unknown(reason) => {
                    debug!(subject = %certificate.subject(), %reason, "no revocation information");
                }
            }
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TrustError> {
    fs::read(path).map_err(|source| TrustError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// DER contents of `bytes`, decoding a PEM block when one is present.
pub(crate) fn der_from_pem_or_der(bytes: &[u8]) -> Result<Vec<u8>, TrustError> {
    let trimmed = bytes.trim_ascii_start();
    if trimmed.starts_with(b"-----BEGIN") {
        let (_, der) = pem::decode_vec(trimmed).map_err(|e| TrustError::Pem(e.to_string()))?;
        Ok(der)
    } else {
        Ok(bytes.to_vec())
    }
}

pub(crate) fn time_to_utc(time: &Time) -> DateTime<Utc> {
    let since_epoch = time.to_unix_duration();
    DateTime::from_timestamp(since_epoch.as_secs() as i64, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn verify_certificate_signature(
    certificate: &Certificate,
    issuer_spki: &SubjectPublicKeyInfoOwned,
) -> Result<(), String> {
    let tbs = certificate
        .tbs_certificate
        .to_der()
        .map_err(|e| format!("failed to encode TBS: {e}"))?;
    let signature = certificate
        .signature
        .as_bytes()
        .ok_or_else(|| "no signature bytes".to_string())?;
    verify_signed_der(
        &tbs,
        &certificate.signature_algorithm.oid.to_string(),
        signature,
        issuer_spki,
    )
}

/// Verify an X.509 style signature (certificates and CRLs) over `tbs`.
pub(crate) fn verify_signed_der(
    tbs: &[u8],
    algorithm_oid: &str,
    signature: &[u8],
    issuer_spki: &SubjectPublicKeyInfoOwned,
) -> Result<(), String> {
    let spki_der = issuer_spki
        .to_der()
        .map_err(|e| format!("failed to encode issuer SPKI: {e}"))?;
    match algorithm_oid {
        OID_SHA1_RSA => verify_rsa::<sha1::Sha1>(&spki_der, tbs, signature),
        OID_SHA256_RSA => verify_rsa::<Sha256>(&spki_der, tbs, signature),
        OID_SHA384_RSA => verify_rsa::<Sha384>(&spki_der, tbs, signature),
        OID_SHA512_RSA => verify_rsa::<Sha512>(&spki_der, tbs, signature),
        OID_ECDSA_SHA256 => verify_ecdsa(
            issuer_spki,
            EcdsaDigest::Sha256,
            EcdsaEncoding::Der,
            tbs,
            signature,
        )?
        .map_err(|e| e.to_string()),
        OID_ECDSA_SHA384 => verify_ecdsa(
            issuer_spki,
            EcdsaDigest::Sha384,
            EcdsaEncoding::Der,
            tbs,
            signature,
        )?
        .map_err(|e| e.to_string()),
        other => Err(format!("unsupported signature algorithm: {other}")),
    }
}

/// Hash an ECDSA signature is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EcdsaDigest {
    Sha256,
    Sha384,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EcdsaEncoding {
    /// ASN.1 `Ecdsa-Sig-Value`, as in certificates and CRLs.
    Der,
    /// `r || s` of the curve's field size (XML-DSig), DER accepted as fallback.
    Fixed,
}

/// Verify an ECDSA signature with the P-256 or P-384 key in `spki`.
///
/// The hash and the curve are independent: the digest is truncated or
/// padded to the curve's field size. The outer error reports an unusable
/// key, the inner result the verdict on the signature.
pub(crate) fn verify_ecdsa(
    spki: &SubjectPublicKeyInfoOwned,
    digest: EcdsaDigest,
    encoding: EcdsaEncoding,
    message: &[u8],
    signature: &[u8],
) -> Result<Result<(), signature::Error>, String> {
    let spki_der = spki
        .to_der()
        .map_err(|e| format!("failed to encode EC public key: {e}"))?;
    let prehash = match digest {
        EcdsaDigest::Sha256 => Sha256::digest(message).to_vec(),
        EcdsaDigest::Sha384 => Sha384::digest(message).to_vec(),
    };
    match curve_oid(spki).as_deref() {
        Some(OID_CURVE_P256) => {
            let key = p256::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
                .map_err(|e| format!("invalid EC P-256 key: {e}"))?;
            let sig = match encoding {
                EcdsaEncoding::Der => p256::ecdsa::Signature::from_der(signature),
                EcdsaEncoding::Fixed => p256::ecdsa::Signature::from_slice(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_der(signature)),
            };
            Ok(sig.and_then(|sig| key.verify_prehash(&prehash, &sig)))
        }
        Some(OID_CURVE_P384) => {
            let key = p384::ecdsa::VerifyingKey::from_public_key_der(&spki_der)
                .map_err(|e| format!("invalid EC P-384 key: {e}"))?;
            let sig = match encoding {
                EcdsaEncoding::Der => p384::ecdsa::Signature::from_der(signature),
                EcdsaEncoding::Fixed => p384::ecdsa::Signature::from_slice(signature)
                    .or_else(|_| p384::ecdsa::Signature::from_der(signature)),
            };
            Ok(sig.and_then(|sig| key.verify_prehash(&prehash, &sig)))
        }
        other => Err(format!("unsupported EC curve: {other:?}")),
    }
}

fn verify_rsa<D>(spki_der: &[u8], message: &[u8], signature: &[u8]) -> Result<(), String>
where
    D: Digest + x509_cert::der::oid::AssociatedOid,
{
    let public_key = rsa::RsaPublicKey::from_public_key_der(spki_der)
        .map_err(|e| format!("invalid RSA public key: {e}"))?;
    let key = rsa::pkcs1v15::VerifyingKey::<D>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .map_err(|e| format!("invalid RSA signature: {e}"))?;
    signature::Verifier::verify(&key, message, &sig).map_err(|e| e.to_string())
}

/// Named curve of an EC public key.
pub(crate) fn curve_oid(spki: &SubjectPublicKeyInfoOwned) -> Option<String> {
    let parameters = spki.algorithm.parameters.as_ref()?;
    ObjectIdentifier::from_bytes(parameters.value())
        .ok()
        .map(|oid| oid.to_string())
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}
