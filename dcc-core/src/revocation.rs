//! Revocation checking for certificate chains.
use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use x509_cert::{
    crl::CertificateList,
    der::{Decode, Encode},
    ext::pkix::{
        CrlDistributionPoints,
        name::{DistributionPointName, GeneralName},
    },
};

use crate::{
    constants::OID_CRL_DISTRIBUTION_POINTS,
    fetch::Fetcher,
    trust::{ParsedCertificate, TrustError, der_from_pem_or_der, time_to_utc, verify_signed_der},
};

/// Why a certificate did not pass the revocation check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevokedReason {
    #[error("revoked since {0}")]
    Listed(DateTime<Utc>),
    #[error("revocation status unknown: {0}")]
    Unknown(String),
}

/// A certificate of the chain failed the revocation check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("certificate {subject} (serial {serial}): {reason}")]
pub struct Revoked {
    pub subject: String,
    pub serial: String,
    pub reason: RevokedReason,
}

impl Revoked {
    pub(crate) fn listed(certificate: &ParsedCertificate, revoked_at: DateTime<Utc>) -> Self {
        Self {
            subject: certificate.subject(),
            serial: certificate.serial(),
            reason: RevokedReason::Listed(revoked_at),
        }
    }

    pub(crate) fn unknown(certificate: &ParsedCertificate, reason: String) -> Self {
        Self {
            subject: certificate.subject(),
            serial: certificate.serial(),
            reason: RevokedReason::Unknown(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked { revoked_at: DateTime<Utc> },
    /// No usable revocation information was found.
    Unknown(String),
}

/// Answers whether `certificate`, issued by `issuer`, is revoked at `at`.
pub trait RevocationSource: Debug + Send + Sync {
    fn status(
        &self,
        certificate: &ParsedCertificate,
        issuer: &ParsedCertificate,
        at: DateTime<Utc>,
    ) -> RevocationStatus;

    /// Whether [`RevocationStatus::Unknown`] fails the check.
    fn is_strict(&self) -> bool {
        false
    }
}

/// CRL backed revocation source.
///
/// Uses the CRLs loaded into it and, when a [`Fetcher`] is configured and
/// no usable local CRL covers the issuer, the CRL published at the
/// certificate's first CRL distribution point (one attempt). A CRL only
/// counts when its signature verifies against the issuing certificate and
/// the verification time lies within its `thisUpdate..nextUpdate` window.
#[derive(Debug, Default)]
pub struct CrlRevocationSource {
    crls: Vec<CertificateList>,
    fetcher: Option<Arc<dyn Fetcher>>,
    strict: bool,
}

impl CrlRevocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Fail certificates for which no revocation information is available.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn add_crl(&mut self, der: &[u8]) -> Result<(), TrustError> {
        let crl = CertificateList::from_der(der)?;
        debug!(issuer = %crl.tbs_cert_list.issuer, "loaded CRL");
        self.crls.push(crl);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.crls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crls.is_empty()
    }

    pub(crate) fn with_crls_from(mut self, other: CrlRevocationSource) -> Self {
        self.crls.extend(other.crls);
        self
    }

    fn fetch_crl(&self, certificate: &ParsedCertificate) -> Option<CertificateList> {
        let fetcher = self.fetcher.as_ref()?;
        let url = distribution_point_urls(certificate).into_iter().next()?;
        let bytes = match fetcher.fetch(&url) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%url, error = %err, "could not fetch CRL");
                return None;
            }
        };
        der_from_pem_or_der(&bytes)
            .ok()
            .and_then(|der| CertificateList::from_der(&der).ok())
            .or_else(|| {
                warn!(%url, "fetched CRL is not a valid CRL");
                None
            })
    }
}

impl RevocationSource for CrlRevocationSource {
    fn status(
        &self,
        certificate: &ParsedCertificate,
        issuer: &ParsedCertificate,
        at: DateTime<Utc>,
    ) -> RevocationStatus {
        let issuer_name = &issuer.certificate().tbs_certificate.subject;
        let mut checked = false;
        for crl in self
            .crls
            .iter()
            .filter(|crl| crl.tbs_cert_list.issuer == *issuer_name)
        {
            match crl_status(crl, certificate, issuer, at) {
                Some(RevocationStatus::Good) => checked = true,
                Some(status) => return status,
                None => {}
            }
        }
        if !checked {
            if let Some(crl) = self.fetch_crl(certificate) {
                match crl_status(&crl, certificate, issuer, at) {
                    Some(RevocationStatus::Good) => checked = true,
                    Some(status) => return status,
                    None => {}
                }
            }
        }

        if checked {
            RevocationStatus::Good
        } else {
            RevocationStatus::Unknown(format!("no current CRL for issuer {}", issuer.subject()))
        }
    }

    fn is_strict(&self) -> bool {
        self.strict
    }
}

/// What `crl` says about `certificate` at `at`, or `None` when the CRL is
/// not signed by `issuer` or is outside its `thisUpdate..nextUpdate` window.
fn crl_status(
    crl: &CertificateList,
    certificate: &ParsedCertificate,
    issuer: &ParsedCertificate,
    at: DateTime<Utc>,
) -> Option<RevocationStatus> {
    if let Err(err) = verify_crl_signature(crl, issuer) {
        warn!(issuer = %issuer.subject(), error = %err, "ignoring CRL with bad signature");
        return None;
    }
    let this_update = time_to_utc(&crl.tbs_cert_list.this_update);
    let next_update = crl.tbs_cert_list.next_update.as_ref().map(time_to_utc);
    if at < this_update || next_update.is_some_and(|next| next < at) {
        warn!(
            issuer = %issuer.subject(),
            %this_update,
            next_update = ?next_update,
            %at,
            "ignoring CRL outside its validity period"
        );
        return None;
    }

    let serial = &certificate.certificate().tbs_certificate.serial_number;
    let listed = crl
        .tbs_cert_list
        .revoked_certificates
        .iter()
        .flatten()
        .find(|entry| entry.serial_number == *serial);
    match listed.map(|entry| time_to_utc(&entry.revocation_date)) {
        Some(revoked_at) if revoked_at <= at => Some(RevocationStatus::Revoked { revoked_at }),
        _ => Some(RevocationStatus::Good),
    }
}

fn verify_crl_signature(crl: &CertificateList, issuer: &ParsedCertificate) -> Result<(), String> {
    let tbs = crl
        .tbs_cert_list
        .to_der()
        .map_err(|e| format!("failed to encode CRL: {e}"))?;
    let signature = crl
        .signature
        .as_bytes()
        .ok_or_else(|| "no signature bytes".to_string())?;
    verify_signed_der(
        &tbs,
        &crl.signature_algorithm.oid.to_string(),
        signature,
        issuer.public_key_info(),
    )
}

/// URIs listed in the certificate's CRL distribution points extension.
pub fn distribution_point_urls(certificate: &ParsedCertificate) -> Vec<String> {
    let Some(extensions) = certificate.certificate().tbs_certificate.extensions.as_ref() else {
        return Vec::new();
    };
    extensions
        .iter()
        .filter(|ext| ext.extn_id.to_string() == OID_CRL_DISTRIBUTION_POINTS)
        .filter_map(|ext| CrlDistributionPoints::from_der(ext.extn_value.as_bytes()).ok())
        .flat_map(|points| points.0)
        .filter_map(|point| match point.distribution_point {
            Some(DistributionPointName::FullName(names)) => Some(names),
            _ => None,
        })
        .flatten()
        .filter_map(|name| match name {
            GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
            _ => None,
        })
        .collect()
}
