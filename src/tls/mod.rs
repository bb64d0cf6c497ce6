pub mod connect;
pub mod issuer;

pub use issuer::CertIssuer;
