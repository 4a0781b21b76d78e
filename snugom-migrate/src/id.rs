use nanoid::nanoid;

/// Alphabet for generated document ids and lock-holder nonces (no ambiguous glyphs).
const DOCUMENT_ID_ALPHABET: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y',
    'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'm', 'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
const DOCUMENT_ID_LENGTH: usize = 20;
const HOLDER_NONCE_LENGTH: usize = 8;

const DEPLOYMENT_ID_ALPHABET: &[char] = &['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
/// Deployment ids are ten digits, shared by every changeset of one update run.
const DEPLOYMENT_ID_LENGTH: usize = 10;

/// `_id` for documents inserted without one.
pub fn generate_document_id() -> String {
    nanoid!(DOCUMENT_ID_LENGTH, DOCUMENT_ID_ALPHABET)
}

pub fn generate_deployment_id() -> String {
    nanoid!(DEPLOYMENT_ID_LENGTH, DEPLOYMENT_ID_ALPHABET)
}

/// Identity stamped into `lockedBy`: host, process id and a per-service nonce.
pub fn generate_holder_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    let nonce = nanoid!(HOLDER_NONCE_LENGTH, DOCUMENT_ID_ALPHABET);
    format!("{host} ({}) #{nonce}", std::process::id())
}
