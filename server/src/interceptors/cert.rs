use tonic::{Request, Status};
use x509_parser::prelude::{FromDer, X509Certificate};

/// A tonic interceptor service function.
///
/// Extracts the subject common name from the client certificate and adds it
/// to the request extensions -- the common name is the username every job
/// operation is keyed by.
pub fn extract_common_name(mut req: Request<()>) -> Result<Request<()>, Status> {
    let certs = req
        .peer_certs()
        .ok_or_else(|| Status::unauthenticated("request missing client cert"))?;
    let der = certs
        .first()
        .ok_or_else(|| Status::unauthenticated("request missing client cert"))?;

    let (rem, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|_| Status::unauthenticated("bad client cert"))?;
    if !rem.is_empty() {
        return Err(Status::unauthenticated("bad client cert"));
    }

    let username = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Status::unauthenticated("client cert missing common name"))?;
    if username.is_empty() {
        return Err(Status::unauthenticated("client cert common name is empty"));
    }

    let username = username.to_string();
    req.extensions_mut().insert(UserExtension { username });
    Ok(req)
}

#[derive(Clone)]
pub struct UserExtension {
    pub username: String,
}
