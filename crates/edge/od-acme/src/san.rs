//! X.509 inspection: SAN set and expiry of an issued certificate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

use crate::types::{AcmeError, AcmeResult};

#[derive(Debug, Clone)]
pub struct CertFacts {
    pub sans: BTreeSet<String>,
    pub not_after: DateTime<Utc>,
}

/// Parse the first certificate of a PEM chain.
pub fn inspect_pem(pem: &str) -> AcmeResult<CertFacts> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| AcmeError::CertParse(format!("pem: {e}")))?;
    let (_, cert) = parse_x509_certificate(&parsed.contents)
        .map_err(|e| AcmeError::CertParse(format!("x509: {e}")))?;

    let mut sans = BTreeSet::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    sans.insert(dns.to_lowercase());
                }
            }
        }
    }

    let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::CertParse("notAfter out of range".to_string()))?;

    Ok(CertFacts { sans, not_after })
}

/// Names the certificate should cover but doesn't.
pub fn missing_sans(facts: &CertFacts, expected: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|name| !facts.sans.contains(&name.to_lowercase()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed(names: &[&str]) -> String {
        let params =
            CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn extracts_san_set() {
        let pem = self_signed(&["example.com", "www.example.com", "api.example.com"]);
        let facts = inspect_pem(&pem).unwrap();
        assert!(facts.sans.contains("example.com"));
        assert!(facts.sans.contains("www.example.com"));
        assert!(facts.sans.contains("api.example.com"));
    }

    #[test]
    fn reports_missing_names() {
        let pem = self_signed(&["example.com", "www.example.com"]);
        let facts = inspect_pem(&pem).unwrap();
        let expected = vec![
            "example.com".to_string(),
            "www.example.com".to_string(),
            "api.example.com".to_string(),
        ];
        assert_eq!(missing_sans(&facts, &expected), vec!["api.example.com"]);
    }

    #[test]
    fn case_insensitive_match() {
        let pem = self_signed(&["example.com"]);
        let facts = inspect_pem(&pem).unwrap();
        assert!(missing_sans(&facts, &["Example.COM".to_string()]).is_empty());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(inspect_pem("not a pem").is_err());
    }

    #[test]
    fn expiry_is_in_the_future_for_fresh_cert() {
        let pem = self_signed(&["example.com"]);
        let facts = inspect_pem(&pem).unwrap();
        assert!(facts.not_after > Utc::now());
    }
}
