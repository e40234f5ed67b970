pub mod issuer;
pub mod types;

pub use issuer::CertificateIssuer;
pub use types::{
    CertificateRequest, CertificateStats, CertificateType, ImpactCertificate, IssuedCertificate,
};
