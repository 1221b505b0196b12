//! Namespace and algorithm identifiers used while reading DCC documents.

pub(crate) const DCC_NS: &str = "https://ptb.de/dcc";
pub(crate) const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub(crate) const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";

/// Reserved key holding element text next to attributes or child elements.
pub const TEXT_KEY: &str = "#text";
/// Prefix marking attribute keys in the generic tree.
pub const ATTRIBUTE_PREFIX: char = '@';

// Canonicalization
pub(crate) const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub(crate) const C14N_WITH_COMMENTS: &str =
    "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
pub(crate) const C14N11: &str = "http://www.w3.org/2006/12/xml-c14n11";
pub(crate) const C14N11_WITH_COMMENTS: &str = "http://www.w3.org/2006/12/xml-c14n11#WithComments";
pub(crate) const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub(crate) const EXC_C14N_WITH_COMMENTS: &str =
    "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
/// Namespace of `InclusiveNamespaces`, carrying the exclusive C14N prefix list.
pub(crate) const EXC_C14N_NS: &str = EXC_C14N;

// Transforms
pub(crate) const ENVELOPED_SIGNATURE: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

// Digests
pub(crate) const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub(crate) const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub(crate) const SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub(crate) const SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

// Signature methods
pub(crate) const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub(crate) const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub(crate) const RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
pub(crate) const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
pub(crate) const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
pub(crate) const ECDSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384";

// X.509 signature algorithm OIDs
pub(crate) const OID_SHA1_RSA: &str = "1.2.840.113549.1.1.5";
pub(crate) const OID_SHA256_RSA: &str = "1.2.840.113549.1.1.11";
pub(crate) const OID_SHA384_RSA: &str = "1.2.840.113549.1.1.12";
pub(crate) const OID_SHA512_RSA: &str = "1.2.840.113549.1.1.13";
pub(crate) const OID_ECDSA_SHA256: &str = "1.2.840.10045.4.3.2";
pub(crate) const OID_ECDSA_SHA384: &str = "1.2.840.10045.4.3.3";
pub(crate) const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
pub(crate) const OID_CURVE_P384: &str = "1.3.132.0.34";
pub(crate) const OID_CRL_DISTRIBUTION_POINTS: &str = "2.5.29.31";
