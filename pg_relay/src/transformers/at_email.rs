use sha2::{Digest, Sha256};

use crate::conversions::cell::CellValue;

use super::{
    parameter_or_default, ParameterValues, SupportedType, Transformer, TransformerError,
};

const OUTPUT_ALPHABET: &[u8; 62] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

const COMPATIBLE_TYPES: &[SupportedType] = &[SupportedType::String];

/// Scrambles email addresses while keeping them email-shaped: the mailbox
/// and original domain are hashed into alphanumerics of the same length and
/// a fixed replacement domain is appended. Addresses on the exclude domain
/// pass through unchanged.
pub struct AtEmailTransformer {
    replacement_domain: String,
    exclude_domain: String,
    salt: String,
}

impl AtEmailTransformer {
    pub fn new(params: &ParameterValues) -> Result<Self, TransformerError> {
        Ok(Self {
            replacement_domain: parameter_or_default(params, "replacement_domain", "@crypt.com"),
            exclude_domain: parameter_or_default(params, "exclude_domain", ""),
            salt: parameter_or_default(params, "salt", "defaultsalt"),
        })
    }

    fn scramble_email(&self, s: &str) -> String {
        if s.len() < 2 {
            return s.to_string();
        }
        // `{a@x.com,b@y.com}` is the text form of an email array; scramble
        // each element, preserving the braces and commas.
        if let Some(inner) = s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let parts: Vec<String> = inner
                .split(',')
                .map(|part| self.scramble_one_email(part))
                .collect();
            return format!("{{{}}}", parts.join(","));
        }
        self.scramble_one_email(s)
    }

    fn scramble_one_email(&self, s: &str) -> String {
        let (mailbox, domain) = match s.find('@') {
            Some(at) => (&s[..at], &s[at + 1..]),
            // No mailbox to preserve the length of; the salt stands in.
            None => (self.salt.as_str(), s),
        };
        if domain == self.exclude_domain {
            return s.to_string();
        }

        let mut scrambled = scramble(&format!("{mailbox}{domain}"), &self.salt);
        scrambled.push_str(&self.replacement_domain);
        scrambled
    }
}

/// Maps every char of `s` onto the output alphabet, keyed by a SHA-256
/// digest of the salted input. Same length, same input, same output.
fn scramble(s: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(s.as_bytes());
    let digest = hasher.finalize();

    s.chars()
        .enumerate()
        .map(|(i, r)| {
            let low = r as u32 as u8;
            let index = digest[i % digest.len()].wrapping_add(low) as usize;
            OUTPUT_ALPHABET[index % OUTPUT_ALPHABET.len()] as char
        })
        .collect()
}

impl Transformer for AtEmailTransformer {
    fn transform(&self, value: CellValue) -> Result<CellValue, TransformerError> {
        match value {
            CellValue::String(s) => Ok(CellValue::String(self.scramble_email(&s))),
            _ => Err(TransformerError::UnsupportedValueType),
        }
    }

    fn compatible_types(&self) -> &[SupportedType] {
        COMPATIBLE_TYPES
    }
}
