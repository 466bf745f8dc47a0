//! Self-signed fallback certificate, used as the default SNI material
//! until real certificates exist.

use chrono::{Duration as ChronoDuration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use od_config::CertMaterial;

use crate::types::AcmeResult;

const VALIDITY_DAYS: i64 = 365;

/// Generate a 1-year self-signed certificate for the platform hostname.
pub fn generate(common_name: &str) -> AcmeResult<CertMaterial> {
    let mut params = CertificateParams::new(vec![common_name.to_string()])?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "odac");
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(CertMaterial {
        key: key_pair.serialize_pem(),
        cert: cert.pem(),
        expiry: Utc::now() + ChronoDuration::days(VALIDITY_DAYS),
    })
}
