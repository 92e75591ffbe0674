//! Enrollment of a secret into an authenticator app: base32 text, key URI
//! and a QR code for the terminal.
//!
//! cf. <https://github.com/google/google-authenticator/wiki/Key-Uri-Format>

use qrcode::render::unicode;
use qrcode::types::QrError;
use qrcode::QrCode;

use crate::secret::Secret;

const LABEL: &str = "TPM2-TOTP";

pub fn base32(secret: &Secret) -> String {
    data_encoding::BASE32.encode(secret.as_bytes())
}

/// `otpauth://totp/TPM2-TOTP?secret=<base32>`
pub fn url(secret: &Secret) -> String {
    format!("otpauth://totp/{}?secret={}", LABEL, base32(secret))
}

/// Renders `data` with half-height block characters, dark modules light, so
/// it scans on a dark terminal.
pub fn qr(data: &str) -> Result<String, QrError> {
    let code = QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_unpadded_base32() {
        let secret = Secret::from(&b"12345678901234567890"[..]);
        assert_eq!(base32(&secret), "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ");
        assert_eq!(
            url(&secret),
            "otpauth://totp/TPM2-TOTP?secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ"
        );
    }

    #[test]
    fn qr_renders_square_block() {
        let rendered = qr("otpauth://totp/TPM2-TOTP?secret=GEZDGNBV").unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines.len() > 10);
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|line| line.chars().count() == width));
    }
}
