//! Certificate chains backing ticket signatures.
//!
//! A chain file is a concatenation of certificate records. Each record
//! has a variable-size signature block, then a signed body: issuer,
//! key type, subject and the public key material. A ticket's issuer
//! string (`Root-CA00000003-XS00000020`) names the certificate that
//! signed it; that certificate's issuer names the next link, up to the
//! `Root` anchor.

use byteorder::{ByteOrder, LittleEndian};
use rsa::{BigUint, RsaPublicKey};
use thiserror::Error;
use tracing::{debug, trace};

use crate::ticket::Ticket;
use hoshi_crypto::rsa_verify;

pub const SIG_TYPE_RSA4096_SHA256: u32 = 0x10003;
pub const SIG_TYPE_RSA2048_SHA256: u32 = 0x10004;

const KEY_TYPE_RSA4096: u32 = 0;
const KEY_TYPE_RSA2048: u32 = 1;
const KEY_TYPE_ECC: u32 = 2;

/// Issuer name of the trust anchor.
pub const ROOT_ISSUER: &str = "Root";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Certificate record truncated at offset {0:#x}")]
    Truncated(usize),

    #[error("Unsupported certificate signature type {0:#x}")]
    UnsupportedSignatureType(u32),

    #[error("Unsupported certificate key type {0}")]
    UnsupportedKeyType(u32),

    #[error("Chain contains no certificates")]
    Empty,

    #[error(transparent)]
    Rsa(#[from] rsa::Error),
}

pub type Result<T> = std::result::Result<T, CertError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertKeyType {
    Rsa4096,
    Rsa2048,
    Ecc,
}

/// One certificate record.
#[derive(Clone)]
pub struct Certificate {
    signature_type: u32,
    signature: Vec<u8>,
    issuer: String,
    subject: String,
    key_type: CertKeyType,
    /// Absent for ECC certificates, which the pipeline cannot check.
    public_key: Option<RsaPublicKey>,
    signed_body: Vec<u8>,
}

impl Certificate {
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The name child records use to refer to this certificate.
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.issuer, self.subject)
    }

    pub fn key_type(&self) -> CertKeyType {
        self.key_type
    }

    pub fn public_key(&self) -> Option<&RsaPublicKey> {
        self.public_key.as_ref()
    }

    pub fn is_root_signed(&self) -> bool {
        self.issuer == ROOT_ISSUER
    }

    /// Verify this record's own signature with `issuer_key`.
    pub fn verify_with(&self, issuer_key: &RsaPublicKey) -> bool {
        match self.signature_type {
            SIG_TYPE_RSA4096_SHA256 | SIG_TYPE_RSA2048_SHA256 => {
                rsa_verify::verify_pkcs1v15_sha256(issuer_key, &self.signed_body, &self.signature)
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("issuer", &self.issuer)
            .field("subject", &self.subject)
            .field("key_type", &self.key_type)
            .finish_non_exhaustive()
    }
}

/// A parsed chain file.
#[derive(Debug, Clone)]
pub struct CertChain {
    certs: Vec<Certificate>,
}

impl CertChain {
    /// Parse every record in `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut certs = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (cert, consumed) = parse_record(&bytes[offset..], offset)?;
            trace!(issuer = %cert.issuer, subject = %cert.subject, "parsed certificate");
            certs.push(cert);
            offset += consumed;
        }
        if certs.is_empty() {
            return Err(CertError::Empty);
        }
        Ok(Self { certs })
    }

    pub fn certs(&self) -> &[Certificate] {
        &self.certs
    }

    /// Look up a certificate by the `issuer-subject` name a child
    /// record or ticket uses.
    pub fn find(&self, full_name: &str) -> Option<&Certificate> {
        self.certs.iter().find(|c| c.full_name() == full_name)
    }

    /// Verify every record against its issuer within the chain.
    /// Records issued by `Root` are checked against `root_key` when
    /// one is supplied, and taken as anchors otherwise.
    pub fn verify(&self, root_key: Option<&RsaPublicKey>) -> bool {
        for cert in &self.certs {
            let ok = if cert.is_root_signed() {
                match root_key {
                    Some(key) => cert.verify_with(key),
                    None => true,
                }
            } else {
                self.find(&cert.issuer)
                    .and_then(Certificate::public_key)
                    .is_some_and(|key| cert.verify_with(key))
            };
            if !ok {
                debug!(subject = %cert.subject, "certificate failed verification");
                return false;
            }
        }
        true
    }

    /// Verify a ticket's signature against its issuing certificate.
    /// Returns `false` when the issuer is missing from the chain.
    pub fn verify_ticket(&self, ticket: &Ticket) -> bool {
        let Some(cert) = self.find(&ticket.issuer()) else {
            debug!(issuer = %ticket.issuer(), "ticket issuer not in chain");
            return false;
        };
        let Some(key) = cert.public_key() else {
            return false;
        };
        rsa_verify::verify_pkcs1v15_sha256(key, ticket.signed_body(), ticket.signature())
    }
}

fn parse_record(bytes: &[u8], base: usize) -> Result<(Certificate, usize)> {
    if bytes.len() < 4 {
        return Err(CertError::Truncated(base));
    }
    let signature_type = LittleEndian::read_u32(bytes);
    let (sig_len, pad_len) = match signature_type {
        SIG_TYPE_RSA4096_SHA256 => (0x200, 0x3C),
        SIG_TYPE_RSA2048_SHA256 => (0x100, 0x3C),
        other => return Err(CertError::UnsupportedSignatureType(other)),
    };

    let body_start = 4 + sig_len + pad_len;
    // issuer + key_type + subject + date
    let fixed_body = 0x40 + 4 + 0x40 + 4;
    if bytes.len() < body_start + fixed_body {
        return Err(CertError::Truncated(base));
    }
    let signature = bytes[4..4 + sig_len].to_vec();
    let body = &bytes[body_start..];

    let issuer = c_string(&body[..0x40]);
    let key_type_raw = LittleEndian::read_u32(&body[0x40..0x44]);
    let subject = c_string(&body[0x44..0x84]);

    let (key_type, key_data_len) = match key_type_raw {
        KEY_TYPE_RSA4096 => (CertKeyType::Rsa4096, 0x200 + 4 + 0x34),
        KEY_TYPE_RSA2048 => (CertKeyType::Rsa2048, 0x100 + 4 + 0x34),
        KEY_TYPE_ECC => (CertKeyType::Ecc, 0x3C + 0x3C),
        other => return Err(CertError::UnsupportedKeyType(other)),
    };

    let body_len = fixed_body + key_data_len;
    if body.len() < body_len {
        return Err(CertError::Truncated(base));
    }

    let key_material = &body[0x88..];
    let public_key = match key_type {
        CertKeyType::Rsa4096 | CertKeyType::Rsa2048 => {
            let modulus_len = if key_type == CertKeyType::Rsa4096 {
                0x200
            } else {
                0x100
            };
            let n = BigUint::from_bytes_be(&key_material[..modulus_len]);
            let e = BigUint::from(LittleEndian::read_u32(
                &key_material[modulus_len..modulus_len + 4],
            ));
            Some(RsaPublicKey::new(n, e)?)
        }
        CertKeyType::Ecc => None,
    };

    let cert = Certificate {
        signature_type,
        signature,
        issuer,
        subject,
        key_type,
        public_key,
        signed_body: body[..body_len].to_vec(),
    };
    Ok((cert, body_start + body_len))
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Fabricates certificate records for tests and repackaging.
pub struct CertificateBuilder {
    issuer: String,
    subject: String,
    public_key: Option<RsaPublicKey>,
}

impl CertificateBuilder {
    pub fn new(issuer: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            subject: subject.into(),
            public_key: None,
        }
    }

    /// RSA-2048 key the certificate vouches for.
    pub fn public_key(mut self, key: RsaPublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    /// Emit the record, signed with the issuer's RSA-2048 key.
    pub fn sign(self, issuer_key: &rsa::RsaPrivateKey) -> Result<Vec<u8>> {
        use rsa::Pkcs1v15Sign;
        use sha2::{Digest, Sha256};

        let mut body = Vec::new();
        body.extend_from_slice(&name_field(&self.issuer));
        body.extend_from_slice(&KEY_TYPE_RSA2048.to_le_bytes());
        body.extend_from_slice(&name_field(&self.subject));
        body.extend_from_slice(&0u32.to_le_bytes());
        let key = self.public_key.unwrap_or_else(|| issuer_key.to_public_key());
        body.extend_from_slice(&modulus_bytes(&key));
        use rsa::traits::PublicKeyParts;
        let e_bytes = key.e().to_bytes_le();
        let mut exponent = [0u8; 4];
        let len = e_bytes.len().min(4);
        exponent[..len].copy_from_slice(&e_bytes[..len]);
        body.extend_from_slice(&exponent);
        body.extend_from_slice(&[0u8; 0x34]);

        let digest = Sha256::digest(&body);
        let signature = issuer_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;

        let mut record = Vec::new();
        record.extend_from_slice(&SIG_TYPE_RSA2048_SHA256.to_le_bytes());
        record.extend_from_slice(&signature);
        record.extend_from_slice(&[0u8; 0x3C]);
        record.extend_from_slice(&body);
        Ok(record)
    }
}

fn name_field(name: &str) -> [u8; 0x40] {
    let mut field = [0u8; 0x40];
    let len = name.len().min(0x3F);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    field
}

fn modulus_bytes(key: &RsaPublicKey) -> [u8; 0x100] {
    use rsa::traits::PublicKeyParts;
    let raw = key.n().to_bytes_be();
    let mut out = [0u8; 0x100];
    out[0x100 - raw.len()..].copy_from_slice(&raw);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::nca::RightsId;
    use crate::ticket::TicketBuilder;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};
    use sha2::{Digest, Sha256};

    struct TestChain {
        chain: CertChain,
        xs_key: RsaPrivateKey,
        root_key: RsaPrivateKey,
    }

    fn build_chain() -> TestChain {
        let mut rng = rand::thread_rng();
        let root_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let ca_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let xs_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let ca = CertificateBuilder::new("Root", "CA00000003")
            .public_key(ca_key.to_public_key())
            .sign(&root_key)
            .unwrap();
        let xs = CertificateBuilder::new("Root-CA00000003", "XS00000020")
            .public_key(xs_key.to_public_key())
            .sign(&ca_key)
            .unwrap();

        let mut blob = ca;
        blob.extend_from_slice(&xs);
        TestChain {
            chain: CertChain::parse(&blob).unwrap(),
            xs_key,
            root_key,
        }
    }

    #[test]
    fn chain_parses_and_verifies() {
        let t = build_chain();
        assert_eq!(t.chain.certs().len(), 2);

        let xs = t.chain.find("Root-CA00000003-XS00000020").unwrap();
        assert_eq!(xs.subject(), "XS00000020");
        assert_eq!(xs.key_type(), CertKeyType::Rsa2048);

        assert!(t.chain.verify(None));
        assert!(t.chain.verify(Some(&t.root_key.to_public_key())));

        // Wrong anchor rejects the CA link.
        let mut rng = rand::thread_rng();
        let stranger = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        assert!(!t.chain.verify(Some(&stranger.to_public_key())));
    }

    #[test]
    fn ticket_verifies_against_issuing_cert() {
        let t = build_chain();

        let unsigned = TicketBuilder::new()
            .rights_id(RightsId::from_hex("01000000000100000000000000000003").unwrap())
            .issuer("Root-CA00000003-XS00000020")
            .build()
            .unwrap();
        let digest = Sha256::digest(unsigned.signed_body());
        let sig = t.xs_key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();
        let ticket = TicketBuilder::new()
            .rights_id(RightsId::from_hex("01000000000100000000000000000003").unwrap())
            .issuer("Root-CA00000003-XS00000020")
            .signature(sig.try_into().unwrap())
            .build()
            .unwrap();

        assert!(t.chain.verify_ticket(&ticket));

        // Unknown issuer fails closed.
        let stray = TicketBuilder::new().issuer("Root-CA00000003-XS00000099").build().unwrap();
        assert!(!t.chain.verify_ticket(&stray));
    }

    #[test]
    fn tampered_cert_fails() {
        let t = build_chain();
        let mut rng = rand::thread_rng();
        let other = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        // Re-issue the XS cert with a key the CA never signed.
        let forged = CertificateBuilder::new("Root-CA00000003", "XS00000020")
            .public_key(other.to_public_key())
            .sign(&other)
            .unwrap();
        let mut blob = Vec::new();
        for cert in t.chain.certs() {
            if cert.subject() != "XS00000020" {
                // keep only the CA record
                blob.extend_from_slice(
                    &CertificateBuilder::new("Root", "CA00000003")
                        .public_key(cert.public_key().unwrap().clone())
                        .sign(&t.root_key)
                        .unwrap(),
                );
            }
        }
        blob.extend_from_slice(&forged);
        let chain = CertChain::parse(&blob).unwrap();
        assert!(!chain.verify(None));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let t = build_chain();
        let ca = CertificateBuilder::new("Root", "CA00000003")
            .sign(&t.root_key)
            .unwrap();
        let err = CertChain::parse(&ca[..ca.len() - 16]).unwrap_err();
        assert!(matches!(err, CertError::Truncated(_)));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(CertChain::parse(&[]).unwrap_err(), CertError::Empty));
    }
}
