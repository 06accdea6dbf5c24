/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outgoing HTTP signatures (draft-cavage, `rsa-sha256`).

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use rsa::{
    pkcs1v15::SigningKey,
    pkcs8::DecodePrivateKey,
    signature::{RandomizedSigner, SignatureEncoding},
    RsaPrivateKey,
};
use sha2::{Digest, Sha256};

/// Headers covered by a signed POST to an inbox.
pub const POST_SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date", "digest", "content-type"];

/// A parsed signing key bound to its public `keyId`.
#[derive(Clone)]
pub struct RequestSigner {
    key_id: String,
    signing_key: SigningKey<Sha256>,
}

impl RequestSigner {
    pub fn from_pkcs8_pem(key_id: &str, private_key_pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .context("parse private key pem")?;
        Ok(Self {
            key_id: key_id.to_string(),
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Fills in `Date`, `Digest` and `Host` when missing, then adds `Signature`.
    pub fn sign(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &mut HeaderMap,
        body: &[u8],
        signed_headers: &[&str],
    ) -> Result<()> {
        if !headers.contains_key("Date") {
            let date = httpdate::fmt_http_date(std::time::SystemTime::now());
            headers.insert("Date", date.parse().context("set Date")?);
        }

        let signed: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
        if signed.iter().any(|h| h == "digest") && !headers.contains_key("Digest") {
            headers.insert("Digest", digest_header(body).parse().context("set Digest")?);
        }
        if !headers.contains_key("Host") {
            if let Some(auth) = uri.authority() {
                headers.insert("Host", auth.as_str().parse().context("set Host")?);
            }
        }

        let signing_string = build_signing_string(method, uri, headers, &signed)?;
        let mut rng = rand::rngs::OsRng;
        let signature = self.signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
        let sig_b64 = B64.encode(signature.to_bytes());

        let sig_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{sig_b64}\"",
            self.key_id,
            signed.join(" ")
        );
        headers.insert("Signature", sig_header.parse().context("set Signature")?);
        Ok(())
    }
}

pub fn digest_header(body: &[u8]) -> String {
    format!("SHA-256={}", B64.encode(Sha256::digest(body)))
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut lines = Vec::with_capacity(signed_headers.len());
    for name in signed_headers {
        if name == "(request-target)" {
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            lines.push(format!(
                "(request-target): {} {}{query}",
                method.as_str().to_ascii_lowercase(),
                uri.path()
            ));
            continue;
        }
        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        lines.push(format!("{name}: {}", value.trim()));
    }
    Ok(lines.join("\n"))
}
