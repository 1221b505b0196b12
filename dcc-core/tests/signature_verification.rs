mod common;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use common::{FakeFetcher, GP_DCC, SigningOptions, TestPki, der, read_fixture, sign_dcc_with};
use dcc_core::config::Config;
use dcc_core::revocation::{CrlRevocationSource, RevokedReason};
use dcc_core::trust::{ChainError, TrustStore};
use dcc_core::{CheckState, Dcc, Error, SignatureError, StatusKind};

const CRL_URL: &str = "http://crl.dcc.test/sub.crl";

fn signed_gp(pki: &TestPki) -> String {
    pki.sign(&read_fixture(GP_DCC))
}

fn load_with(xml: String, store: TrustStore) -> Result<Dcc, Error> {
    Dcc::builder().bytes(xml).trust_store(Arc::new(store)).load()
}

fn signature_error(result: Result<Dcc, Error>) -> SignatureError {
    match result {
        Err(Error::Signature(err)) => err,
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("verification unexpectedly succeeded"),
    }
}

#[test]
fn valid_signature_is_accepted() {
    let pki = TestPki::new("Valid", 0x21);
    let dcc = load_with(signed_gp(&pki), pki.trust_store()).expect("verified DCC");

    let report = dcc.status_report();
    assert!(report.is_signed());
    assert_eq!(report.valid_signature(), Some(true));
    assert_eq!(report.state(StatusKind::ValidChain), CheckState::Pass);
    assert_eq!(report.state(StatusKind::NotRevoked), CheckState::Pass);
    assert!(report.get_status_summary(&[]));

    assert_eq!(dcc.uid(), Some("GP_DCC_temperature_typical_1.2"));
    assert_eq!(dcc.get_calibration_results(dcc_core::query::ResultLabel::Name).len(), 3);
}

#[test]
fn signing_time_and_signer_are_exposed() {
    let pki = TestPki::new("Details", 0x31);
    let dcc = load_with(signed_gp(&pki), pki.trust_store()).expect("verified DCC");

    let expected = Utc.with_ymd_and_hms(2023, 3, 27, 15, 14, 30).single();
    assert_eq!(dcc.get_signing_time(), expected);

    let signer = dcc.get_signer_certificate().expect("signer certificate");
    assert_eq!(signer.der(), der(&pki.signer).as_slice());
    assert!(signer.subject().contains("Details Signer"));
    assert_eq!(signer.serial(), "3");

    let record = dcc.signature_record().expect("signature record");
    assert_eq!(
        record.signature_method(),
        "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256"
    );
    assert_eq!(
        record.digest_methods(),
        &[
            "http://www.w3.org/2001/04/xmlenc#sha256".to_string(),
            "http://www.w3.org/2001/04/xmlenc#sha256".to_string(),
        ]
    );
    assert_eq!(record.signature_value().len(), 64);
    assert!(record.signed_info().starts_with(b"<ds:SignedInfo"));
}

#[test]
fn manipulated_content_fails_integrity() {
    let pki = TestPki::new("Manipulated", 0x41);
    let manipulated = signed_gp(&pki).replacen("Kalibrierfirma GmbH", "Kalibrierfirma AG", 1);
    let err = signature_error(load_with(manipulated, pki.trust_store()));
    assert!(matches!(err, SignatureError::Integrity(_)), "{err}");
}

#[test]
fn manipulated_signing_time_fails_integrity() {
    let pki = TestPki::new("Backdated", 0x45);
    let manipulated = signed_gp(&pki).replace("2023-03-27T15:14:30Z", "2020-01-01T00:00:00Z");
    let err = signature_error(load_with(manipulated, pki.trust_store()));
    assert!(matches!(err, SignatureError::Integrity(_)), "{err}");
}

#[test]
fn signature_must_cover_the_document() {
    let pki = TestPki::new("PropertiesOnly", 0x47);
    let options = SigningOptions {
        properties_only: true,
        ..SigningOptions::default()
    };
    let signed = sign_dcc_with(&read_fixture(GP_DCC), &pki.signer_key, &pki.signer, options);

    let err = signature_error(load_with(signed.clone(), pki.trust_store()));
    assert!(matches!(err, SignatureError::Integrity(_)), "{err}");

    let rewritten = signed.replacen("Kalibrierfirma GmbH", "Evil Labs Ltd", 1);
    let mut dcc = Dcc::from_bytes(rewritten).expect("load rewritten DCC");
    assert!(dcc.verify_signature(&pki.trust_store()).is_err());
    assert_eq!(dcc.status_report().valid_signature(), Some(false));
}

#[test]
fn exclusive_canonicalization_uses_prefix_list() {
    let pki = TestPki::new("Exclusive", 0x49);
    let options = SigningOptions {
        exclusive_prefixes: Some("ds dcc"),
        ..SigningOptions::default()
    };
    let signed = sign_dcc_with(&read_fixture(GP_DCC), &pki.signer_key, &pki.signer, options);
    let dcc = load_with(signed, pki.trust_store()).expect("verified DCC");
    assert_eq!(dcc.status_report().valid_signature(), Some(true));

    let record = dcc.signature_record().expect("signature record");
    let signed_info = std::str::from_utf8(record.signed_info()).expect("utf-8 SignedInfo");
    assert!(signed_info.contains(r#"xmlns:dcc="https://ptb.de/dcc""#), "{signed_info}");
}

#[test]
fn signer_outside_trust_store_is_rejected() {
    let trusted = TestPki::new("Trusted", 0x51);
    let foreign = TestPki::new("Foreign", 0x61);
    let err = signature_error(load_with(signed_gp(&foreign), trusted.trust_store()));
    assert!(
        matches!(err, SignatureError::Trust(ChainError::ChainBroken { .. })),
        "{err}"
    );
}

#[test]
fn missing_intermediate_breaks_the_chain() {
    let pki = TestPki::new("NoSub", 0x71);
    let mut store = TrustStore::new();
    store
        .load_trusted_root_from_bytes(&der(&pki.root))
        .expect("load root");
    let err = signature_error(load_with(signed_gp(&pki), store));
    match err {
        SignatureError::Trust(ChainError::ChainBroken { subject }) => {
            assert!(subject.contains("NoSub Signer"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn empty_trust_store_has_no_root() {
    let pki = TestPki::new("Rootless", 0x75);
    let err = signature_error(load_with(signed_gp(&pki), TrustStore::new()));
    assert!(matches!(err, SignatureError::Trust(ChainError::NoTrustedRoot)));
}

#[test]
fn expired_signer_is_rejected() {
    let pki = TestPki::new("Expired", 0x81);
    let store = pki.trust_store().verify_at(Utc::now() + Duration::days(2 * 365));
    let err = signature_error(load_with(signed_gp(&pki), store));
    assert!(
        matches!(err, SignatureError::Trust(ChainError::ExpiredCertificate { .. })),
        "{err}"
    );
}

#[test]
fn revoked_signer_is_rejected() {
    let pki = TestPki::new("Revoked", 0x91);
    let mut store = pki.trust_store();
    store
        .load_crl_from_bytes(&pki.crl_revoking_signer())
        .expect("load CRL");
    let err = signature_error(load_with(signed_gp(&pki), store));
    match err {
        SignatureError::Revoked(revoked) => {
            assert_eq!(revoked.serial, "3");
            assert!(matches!(revoked.reason, RevokedReason::Listed(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn crl_without_signer_entry_passes() {
    let pki = TestPki::new("Listed", 0xa1);
    let mut store = pki.trust_store();
    store.load_crl_from_bytes(&pki.empty_crl()).expect("load CRL");
    let dcc = load_with(signed_gp(&pki), store).expect("verified DCC");
    assert_eq!(dcc.status_report().state(StatusKind::NotRevoked), CheckState::Pass);
}

#[test]
fn crl_from_another_issuer_is_ignored() {
    let pki = TestPki::new("Spoofed", 0xa5);
    let other = TestPki::new("Other", 0xb5);
    let forged = common::build_crl(
        &pki.sub,
        &other.sub_key,
        &[pki.signer.tbs_certificate.serial_number.clone()],
    );
    let mut store = pki.trust_store();
    store.load_crl_from_bytes(&forged).expect("load CRL");
    assert!(load_with(signed_gp(&pki), store).is_ok());
}

#[test]
fn revocation_is_checked_against_published_crl() {
    let pki = TestPki::with_crl_url("Published", 0xc1, CRL_URL);
    let fetcher = Arc::new(FakeFetcher::new().with(CRL_URL, pki.crl_revoking_signer()));
    let store = pki
        .trust_store()
        .with_crl_source(CrlRevocationSource::new().with_fetcher(fetcher.clone()));
    let err = signature_error(load_with(signed_gp(&pki), store));
    assert!(matches!(err, SignatureError::Revoked(_)), "{err}");
    assert_eq!(fetcher.requests(), vec![CRL_URL.to_string()]);
}

#[test]
fn expired_crl_is_not_revocation_information() {
    let pki = TestPki::new("StaleCrl", 0xd5);
    let later = Utc::now() + Duration::days(30);

    let mut store = pki
        .trust_store()
        .verify_at(later)
        .with_crl_source(CrlRevocationSource::new().strict(true));
    store.load_crl_from_bytes(&pki.empty_crl()).expect("load CRL");
    let err = signature_error(load_with(signed_gp(&pki), store));
    match err {
        SignatureError::Revoked(revoked) => {
            assert_eq!(revoked.serial, "3");
            assert!(matches!(revoked.reason, RevokedReason::Unknown(_)));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut current = pki
        .trust_store()
        .with_crl_source(CrlRevocationSource::new().strict(true));
    current.load_crl_from_bytes(&pki.empty_crl()).expect("load CRL");
    current
        .load_crl_from_bytes(&common::build_crl(&pki.root, &pki.root_key, &[]))
        .expect("load root CRL");
    assert!(load_with(signed_gp(&pki), current).is_ok());
}

#[test]
fn strict_revocation_requires_information() {
    let pki = TestPki::new("Strict", 0xd1);
    let store = pki
        .trust_store()
        .with_crl_source(CrlRevocationSource::new().strict(true));
    let err = signature_error(load_with(signed_gp(&pki), store));
    match err {
        SignatureError::Revoked(revoked) => {
            assert!(matches!(revoked.reason, RevokedReason::Unknown(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn verification_can_be_disabled() {
    let pki = TestPki::new("Disabled", 0xe1);
    let other = TestPki::new("Unrelated", 0xe5);
    let dcc = Dcc::builder()
        .bytes(signed_gp(&pki))
        .trust_store(Arc::new(other.trust_store()))
        .signature_verification(false)
        .load()
        .expect("load without verification");
    assert!(dcc.status_report().is_signed());
    assert_eq!(dcc.status_report().valid_signature(), None);
    assert_eq!(dcc.get_signing_time(), None);
    assert!(dcc.get_signer_certificate().is_none());
}

#[test]
fn unsigned_document_skips_verification() {
    let pki = TestPki::new("Unsigned", 0x15);
    let dcc = load_with(read_fixture(GP_DCC), pki.trust_store()).expect("unsigned DCC");
    let report = dcc.status_report();
    assert!(!report.is_signed());
    assert_eq!(report.valid_signature(), None);
    assert_eq!(report.state(StatusKind::ValidChain), CheckState::NotApplicable);
}

#[test]
fn failures_are_recorded_in_status_report() {
    let pki = TestPki::new("Report", 0x25);
    let store = pki.trust_store();

    let mut tampered = Dcc::from_bytes(signed_gp(&pki).replacen("Bezugswert", "Referenz", 1))
        .expect("load tampered");
    assert!(tampered.verify_signature(&store).is_err());
    let report = tampered.status_report();
    assert_eq!(report.valid_signature(), Some(false));
    assert!(report.diagnostic(StatusKind::ValidSignature).is_some());
    assert_eq!(report.state(StatusKind::ValidChain), CheckState::NotApplicable);

    let foreign = TestPki::new("Elsewhere", 0x35);
    let mut untrusted = Dcc::from_bytes(signed_gp(&foreign)).expect("load untrusted");
    assert!(untrusted.verify_signature(&store).is_err());
    assert_eq!(
        untrusted.status_report().state(StatusKind::ValidChain),
        CheckState::Fail
    );

    let mut revoked_store = pki.trust_store();
    revoked_store
        .load_crl_from_bytes(&pki.crl_revoking_signer())
        .expect("load CRL");
    let mut revoked = Dcc::from_bytes(signed_gp(&pki)).expect("load revoked");
    assert!(revoked.verify_signature(&revoked_store).is_err());
    let report = revoked.status_report();
    assert_eq!(report.state(StatusKind::ValidChain), CheckState::Pass);
    assert_eq!(report.state(StatusKind::NotRevoked), CheckState::Fail);
    assert!(!report.get_status_summary(&[]));
    assert!(report.get_status_summary(&[StatusKind::ValidSignature, StatusKind::NotRevoked]));

    revoked.verify_signature(&store).expect("verify against store without CRL");
    assert_eq!(revoked.status_report().valid_signature(), Some(true));
    assert_eq!(
        revoked.status_report().state(StatusKind::NotRevoked),
        CheckState::Pass
    );
}

#[test]
fn untrusted_rerun_clears_earlier_revocation_result() {
    let pki = TestPki::new("Rerun", 0x57);
    let mut dcc = Dcc::from_bytes(signed_gp(&pki)).expect("load signed");
    dcc.verify_signature(&pki.trust_store()).expect("first verification");
    assert_eq!(dcc.status_report().state(StatusKind::NotRevoked), CheckState::Pass);

    let foreign = TestPki::new("Stranger", 0x67);
    assert!(dcc.verify_signature(&foreign.trust_store()).is_err());
    let report = dcc.status_report();
    assert_eq!(report.valid_signature(), Some(false));
    assert_eq!(report.state(StatusKind::ValidChain), CheckState::Fail);
    assert_eq!(report.state(StatusKind::NotRevoked), CheckState::NotApplicable);
    assert!(dcc.get_signer_certificate().is_none());
}
